use std::time::Duration;

use holdfast::{ClientConfig, LockClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::new("http://127.0.0.1:47002");
    let client = LockClient::connect(&config).await?;

    println!("waiting for lock...");
    let mut hold = client.lock("demo/nightly-report").await?;
    println!("acquired, working");

    for round in 1..=3 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        hold.idle().await?;
        println!("round {round}: server still with us");
    }

    hold.release().await;
    println!("released");
    Ok(())
}

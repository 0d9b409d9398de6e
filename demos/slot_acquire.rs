use std::time::Duration;

use holdfast::{ClientConfig, SlotClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::new("http://127.0.0.1:47002");
    let client = SlotClient::connect(config).await?;

    // Up to two concurrent slots; any number of workers may share one.
    let keeper = client.keeper("render-farm", 2).await;
    let mut slot = keeper.slot(&format!("host-{}", std::process::id()));

    if slot.acquire().await? {
        println!("got a slot: {keeper:?}");
        tokio::time::sleep(Duration::from_secs(5)).await;
        slot.release().await;
        println!("done: {keeper:?}");
    } else {
        println!("farm is full: {keeper:?}");
    }
    Ok(())
}

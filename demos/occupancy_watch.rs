use std::time::Duration;

use holdfast::{ClientConfig, SlotClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::new("http://127.0.0.1:47002");
    let client = SlotClient::connect(config).await?;

    client.wait_live().await;
    println!("mirror is live");

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut ids = client.mirror().ids();
        ids.sort();
        for id in ids {
            if let Some(snapshot) = client.mirror().snapshot(&id) {
                println!(
                    "{}: {}/{} slots, {} workers",
                    snapshot.id,
                    snapshot.slots,
                    snapshot.max_slots,
                    snapshot.workers
                );
            }
        }
        println!("--");
    }
}

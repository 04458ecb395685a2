#[tokio::main]
async fn main() {
    if let Err(e) = clip_harvester_lib::run().await {
        eprintln!("clip-harvester: {e}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    let code = match lib_wsbridge::init().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("❌ {e}");
            1
        }
    };

    // A blocked stdin read would otherwise keep the runtime from shutting down.
    std::process::exit(code);
}

//! Example: Basic usage of pixcache

use std::sync::Arc;
use std::time::Duration;

use pixcache::{DecodedImage, LoaderRegistry, RenderTarget};

struct StdoutTarget;

impl RenderTarget for StdoutTarget {
    fn render(&self, image: &Arc<DecodedImage>) {
        println!("rendered {}x{} pixels", image.width, image.height);
    }
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Cache up to a quarter of a 64 MB budget
    let registry = LoaderRegistry::new(64 * 1024 * 1024);
    let loader = registry.widen(0.25);

    let path = std::env::args().nth(1).expect("usage: basic <image-file>");
    let target: Arc<dyn RenderTarget> = Arc::new(StdoutTarget);

    loader
        .display(&path, &target, Some(240))
        .expect("image file must exist");
    loader.wait_until_idle(Duration::from_secs(10));

    let stats = loader.cache_stats();
    println!(
        "cache: {} entries, {} of {} bytes",
        stats.entries, stats.memory_usage, stats.capacity
    );
}

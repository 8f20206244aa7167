use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use crate::layer::StackdriverLayer;
use crate::serializer::FallbackFn;

/// Install a [`Registry`] with a [`StackdriverLayer`] writing to stdout as
/// the global default subscriber, so every `tracing` event in the process
/// is emitted as one JSON line.
pub fn init() {
    let subscriber = Registry::default().with(StackdriverLayer::new());
    tracing::subscriber::set_global_default(subscriber).expect("set global subscriber");
}

/// Like [`init`], with a fallback hook for extra values the serializer
/// does not natively understand.
pub fn init_with_fallback(fallback: FallbackFn) {
    let layer = StackdriverLayer::new().with_fallback(fallback);
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber).expect("set global subscriber");
}

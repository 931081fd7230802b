//! Fixture helpers

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

use varbridge_core::{Caller, SessionId};

static LOGGING: OnceCell<()> = OnceCell::new();

/// Install a test-friendly tracing subscriber once per process
pub fn init_test_logging() {
    LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// A fresh, unique session id
pub fn session(prefix: &str) -> SessionId {
    SessionId(format!("{}-{}", prefix, next_suffix()))
}

/// The owning side of a session
pub fn owner() -> Caller {
    Caller::owner("owner")
}

/// A consumer with its own process handle
pub fn consumer(id: &str) -> Caller {
    Caller::consumer(id).with_handle(format!("{}-pid", id))
}

/// Metadata map from pairs
pub fn metadata(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn next_suffix() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use varbridge_core::CallerKind;

    #[test]
    fn test_fixtures() {
        assert_ne!(session("s"), session("s"));
        assert_eq!(owner().kind, CallerKind::Owner);

        let worker = consumer("worker-1");
        assert_eq!(worker.kind, CallerKind::Consumer);
        assert_eq!(worker.handle.0, "worker-1-pid");

        assert_eq!(metadata(&[("source", "test")]).get("source").map(String::as_str), Some("test"));
    }
}

/// Log capture for tests
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Records every event's level and message while installed as the default
/// subscriber of the current thread
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    records: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLogs {
    /// Install on the current thread until the guard drops. `#[tokio::test]`
    /// runs spawned tasks on the same thread, so their events are captured too.
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::registry().with(logs.clone());
        (logs, tracing::subscriber::set_default(subscriber))
    }

    pub fn at(&self, level: Level) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.at(level).iter().any(|message| message.contains(needle))
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.records
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{error, info};

    #[test]
    fn test_captures_level_and_message() {
        let (logs, _guard) = CapturedLogs::install();
        info!("connected to {}", "primary");
        error!("mirror {} failed", 2);

        assert_eq!(logs.at(Level::INFO), vec!["connected to primary".to_string()]);
        assert!(logs.contains(Level::ERROR, "mirror 2 failed"));
        assert!(!logs.contains(Level::ERROR, "connected"));
    }
}

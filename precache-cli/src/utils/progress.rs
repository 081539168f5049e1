use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use precache_engine::notify::NotifyError;
use precache_engine::{Client, ClientMessage, ProgressEvent, ProgressSource};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;

fn resource_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {pos}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Client rendering resource progress as terminal progress bars
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: true,
        }
    }

    pub fn handle_event(&self, event: &ProgressEvent) {
        if self.disabled {
            return;
        }

        let mut bars = match self.bars.lock() {
            Ok(bars) => bars,
            Err(poisoned) => poisoned.into_inner(),
        };
        let label = event
            .resource_meta
            .as_ref()
            .map(|meta| meta.name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(event.resource_path.as_str())
            .to_string();

        if event.source == ProgressSource::Cache {
            bars.remove(&event.resource_path);
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(resource_style());
            bar.finish_with_message(format!("Cached {label}"));
            return;
        }

        let bar = bars.entry(event.resource_path.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(100));
            bar.set_style(resource_style());
            bar.set_message(format!("Fetching {label}"));
            bar.enable_steady_tick(Duration::from_millis(500));
            bar
        });
        bar.set_position(u64::from(event.progress));

        if event.progress >= 100 {
            if let Some(bar) = bars.remove(&event.resource_path) {
                bar.finish_with_message(format!("Finished {label}"));
            }
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

#[async_trait]
impl Client for ProgressManager {
    fn id(&self) -> &str {
        "terminal"
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), NotifyError> {
        match message {
            ClientMessage::ResourceProgress(event) => self.handle_event(event),
            ClientMessage::VersionActivated { version, .. } => {
                info!(version = %version, "Version activated");
            }
        }
        Ok(())
    }
}

//! Derived values computed from a synced text.
//!
//! The engine does not know what a compute unit does with the source; it
//! feeds the current text and the file's storage key in and publishes
//! whatever comes out. Computation runs on the blocking pool, one run at a
//! time, always on the latest source.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::StorageText;
use crate::key::StorageKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A message about a position in the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Output of one compute run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Compiled {
    /// Opaque frames, passed through untouched.
    pub frames: Vec<Value>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Compiled {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Turns source text into frames and diagnostics.
pub trait Compute: Send + Sync + 'static {
    fn compute(&self, file: &StorageKey, source: &str) -> Compiled;
}

impl<F> Compute for F
where
    F: Fn(&StorageKey, &str) -> Compiled + Send + Sync + 'static,
{
    fn compute(&self, file: &StorageKey, source: &str) -> Compiled {
        self(file, source)
    }
}

/// The latest output of a compute unit over a live text.
///
/// Holds the text adapter, so the text stays live while this exists.
pub struct Derived<C: Compute> {
    text: StorageText,
    output: watch::Receiver<Option<Arc<Compiled>>>,
    task: JoinHandle<()>,
    _compute: std::marker::PhantomData<C>,
}

impl<C: Compute> Derived<C> {
    /// Start recomputing whenever `text` changes. The first run starts
    /// immediately.
    pub fn spawn(text: StorageText, compute: C) -> Self {
        let compute = Arc::new(compute);
        let (tx, output) = watch::channel(None);
        let mut source = text.subscribe();
        let file = text.key().clone();

        let task = tokio::spawn(async move {
            loop {
                let current = source
                    .borrow_and_update()
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let unit = Arc::clone(&compute);
                let key = file.clone();
                match tokio::task::spawn_blocking(move || unit.compute(&key, &current)).await {
                    Ok(compiled) => {
                        log::trace!(
                            "Computed {file}: {} frames, {} diagnostics",
                            compiled.frames.len(),
                            compiled.diagnostics.len()
                        );
                        tx.send_replace(Some(Arc::new(compiled)));
                    }
                    Err(e) => log::error!("Compute for {file} failed: {e}"),
                }
                if source.changed().await.is_err() {
                    break;
                }
            }
        });

        Self {
            text,
            output,
            task,
            _compute: std::marker::PhantomData,
        }
    }

    pub fn key(&self) -> &StorageKey {
        self.text.key()
    }

    pub fn text(&self) -> &StorageText {
        &self.text
    }

    /// Latest output, `None` until the first run finishes.
    pub fn get(&self) -> Option<Arc<Compiled>> {
        self.output.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Compiled>>> {
        self.output.clone()
    }
}

impl<C: Compute> Drop for Derived<C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Binding;
    use crate::clock::LwwClock;
    use crate::registry::Registry;
    use std::time::Duration;
    use tokio::time::timeout;

    /// One frame per non-empty line; `!` lines are errors.
    fn lines(_file: &StorageKey, source: &str) -> Compiled {
        let mut compiled = Compiled::default();
        for (n, line) in source.lines().enumerate() {
            if let Some(msg) = line.strip_prefix('!') {
                compiled.diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    line: n as u32 + 1,
                    column: 1,
                    message: msg.to_string(),
                });
            } else if !line.is_empty() {
                compiled.frames.push(Value::String(line.to_string()));
            }
        }
        compiled
    }

    async fn text(registry: &Arc<Registry>, initial: &str) -> StorageText {
        let initial = Value::String(initial.to_string());
        let handle = registry
            .acquire(
                StorageKey::new("sketches/main.txt").unwrap(),
                Binding::Text,
                || async move { Ok(initial) },
            )
            .await
            .unwrap();
        StorageText::new(handle)
    }

    async fn next(rx: &mut watch::Receiver<Option<Arc<Compiled>>>) -> Arc<Compiled> {
        timeout(Duration::from_secs(5), rx.wait_for(|c| c.is_some()))
            .await
            .unwrap()
            .unwrap()
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_recomputes_on_change() {
        let registry = Arc::new(Registry::new(16, Arc::new(LwwClock::new())));
        let derived = Derived::spawn(text(&registry, "a\nb").await, lines);
        let mut rx = derived.subscribe();

        let first = next(&mut rx).await;
        assert_eq!(first.frames.len(), 2);
        assert!(!first.has_errors());

        rx.mark_unchanged();
        derived.text().set("a\n!broken");
        timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        let second = derived.get().unwrap();
        assert!(second.has_errors());
        assert_eq!(second.diagnostics[0].line, 2);
        assert_eq!(derived.key().as_str(), "sketches/main.txt");
    }
}

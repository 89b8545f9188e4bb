//! Per-request diagnostic trail

use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// One recorded step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEvent {
    pub label: String,
    /// Milliseconds since the request started
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Ordered list of state transitions and engine calls made for one request
#[derive(Debug, Clone, Serialize)]
pub struct History {
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    request_id: u64,
    #[serde(skip)]
    echo: bool,
    events: Vec<HistoryEvent>,
}

impl History {
    /// `echo` additionally logs every event at debug level
    pub fn new(request_id: u64, echo: bool) -> Self {
        Self {
            started: Instant::now(),
            request_id,
            echo,
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, label: impl Into<String>) {
        self.push(label.into(), None);
    }

    pub fn record_with(&mut self, label: impl Into<String>, data: serde_json::Value) {
        self.push(label.into(), Some(data));
    }

    fn push(&mut self, label: String, data: Option<serde_json::Value>) {
        let at_ms = self.started.elapsed().as_millis() as u64;
        if self.echo {
            match &data {
                Some(d) => log::debug!("[request {}] +{}ms {} {}", self.request_id, at_ms, label, d),
                None => log::debug!("[request {}] +{}ms {}", self.request_id, at_ms, label),
            }
        }
        self.events.push(HistoryEvent { label, at_ms, data });
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.label.as_str())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels().any(|l| l == label)
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for event in &self.events {
            write!(f, "  +{}ms {}", event.at_ms, event.label)?;
            if let Some(data) = &event.data {
                write!(f, " {}", data)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

//! TUI 日志层
//!
//! tracing Layer，把事件整理成 [`LogEntry`] 送到日志面板。
//! 经 `LogTracer` 桥接的 `log.*` 元数据字段不显示。

use crate::app::AppEvent;
use blescan_core::{LogEntry, LogLevel};
use std::fmt;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

pub struct TuiLogLayer {
    tx: mpsc::Sender<AppEvent>,
}

impl TuiLogLayer {
    pub fn new(tx: mpsc::Sender<AppEvent>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for TuiLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata
            .level()
            .as_str()
            .parse()
            .unwrap_or(LogLevel::Info);

        let mut text = EventText::default();
        event.record(&mut text);
        let entry = LogEntry::new(level, text.render(metadata.target()));

        // 面板处理不过来时丢弃，不阻塞调用方
        let _ = self.tx.try_send(AppEvent::Log(entry));
    }
}

/// 事件的消息和其余字段，渲染成 `message key=value ...`
#[derive(Default)]
struct EventText {
    message: Option<String>,
    fields: Vec<String>,
}

impl EventText {
    fn render(self, target: &str) -> String {
        let fields = self.fields.join(" ");
        match self.message {
            Some(message) if fields.is_empty() => message,
            Some(message) => format!("{} {}", message, fields),
            None if fields.is_empty() => target.to_string(),
            None => fields,
        }
    }

    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else if !field.name().starts_with("log.") {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

impl Visit for EventText {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }
}

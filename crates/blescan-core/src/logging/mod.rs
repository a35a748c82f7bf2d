//! 日志模块
//!
//! 日志面板共用的级别、条目和有上限的缓冲。

use std::collections::VecDeque;
use std::fmt;

/// 日志级别，越详细数值越大
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// 面板的默认显示级别
    pub fn for_verbosity(verbose: bool) -> Self {
        if verbose { LogLevel::Debug } else { LogLevel::Info }
    }

    pub fn icon(self) -> &'static str {
        match self {
            LogLevel::Error => "❌",
            LogLevel::Warn => "⚠️",
            LogLevel::Info => "📡",
            LogLevel::Debug => "🔍",
            LogLevel::Trace => "📝",
        }
    }

    /// 是否应在 `max` 级别下显示
    pub fn enabled_at(self, max: LogLevel) -> bool {
        self <= max
    }
}

/// 无法识别的日志级别名称
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct ParseLogLevelError(pub String);

impl std::str::FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const NAMES: [(&str, LogLevel); 6] = [
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("WARNING", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Trace),
        ];
        NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s.trim()))
            .map(|&(_, level)| level)
            .ok_or_else(|| ParseLogLevelError(s.to_string()))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        })
    }
}

/// 日志面板条目
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.icon(), self.message)
    }
}

/// 有上限的日志缓冲，满了丢弃最旧的条目
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `max` 级别下可见的条目，从旧到新
    pub fn visible(&self, max: LogLevel) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.level.enabled_at(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("Warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!(
            "loud".parse::<LogLevel>(),
            Err(ParseLogLevelError("loud".into()))
        );
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut logs = LogBuffer::new(2);
        logs.push(LogEntry::new(LogLevel::Info, "one"));
        logs.push(LogEntry::new(LogLevel::Debug, "two"));
        logs.push(LogEntry::new(LogLevel::Warn, "three"));

        assert_eq!(logs.len(), 2);
        let all: Vec<_> = logs.visible(LogLevel::Trace).map(|e| e.message.as_str()).collect();
        assert_eq!(all, ["two", "three"]);
        let info: Vec<_> = logs.visible(LogLevel::Info).map(|e| e.message.as_str()).collect();
        assert_eq!(info, ["three"]);
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(LogLevel::for_verbosity(false), LogLevel::Info);
        assert_eq!(LogLevel::for_verbosity(true), LogLevel::Debug);
        assert!(LogLevel::Error.enabled_at(LogLevel::Info));
        assert!(!LogLevel::Debug.enabled_at(LogLevel::Info));
    }
}

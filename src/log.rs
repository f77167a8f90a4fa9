use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{IsTerminal, Write};
use std::sync::OnceLock;

pub struct DiagnosticsConfig {
    pub namespace: &'static str,
    pub level: LogLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum LogLevel {
    Notice,
    Warn,
    Impossible,
    None,
}

impl LogLevel {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "notice" => Some(Self::Notice),
            "warn" => Some(Self::Warn),
            "impossible" => Some(Self::Impossible),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    fn get_prefix_formatting(self) -> &'static str {
        match self {
            Self::Notice => "",
            Self::Warn => "\x1b[33m",
            Self::Impossible => "\x1b[31m",
            Self::None => unreachable!(),
        }
    }

    fn get_prefix_text(self) -> &'static str {
        match self {
            Self::Notice => "",
            Self::Warn => "Warning: ",
            Self::Impossible => {
                "genpack-helper has encountered a situation that should have been impossible. \
                 Mounts or scratch directories may have been left behind. Please report this as \
                 a bug. The error is:\n\n"
            }
            Self::None => unreachable!(),
        }
    }
}

static DIAGNOSTICS_CONFIG: OnceLock<DiagnosticsConfig> = OnceLock::new();

static DEFAULT_CONFIG: DiagnosticsConfig = DiagnosticsConfig {
    namespace: "genpack-helper",
    level: LogLevel::Warn,
};

#[macro_export]
macro_rules! log_level {
    (notice) => {
        $crate::log::LogLevel::Notice
    };
    (warn) => {
        $crate::log::LogLevel::Warn
    };
    (impossible) => {
        $crate::log::LogLevel::Impossible
    };
    (none) => {
        $crate::log::LogLevel::None
    };
}

#[macro_export]
macro_rules! log {
    ($format:literal $($rest:tt)*) => {
        log!(notice, $format $($rest)*);
    };
    ($level:ident, $($args:tt)*) => {
        $crate::log::do_log(
            $crate::log_level!($level),
            file!(),
            || format!($($args)*),
        );
    };
}

/// Installs the process-wide log threshold. Only the first call has an effect.
pub fn enable_diagnostics(namespace: &'static str, level: LogLevel) {
    let _ = DIAGNOSTICS_CONFIG.set(DiagnosticsConfig { namespace, level });
}

static COLORS: [(u8, u8, u8); 23] = [
    (255, 0, 0),
    (255, 42, 0),
    (255, 85, 0),
    (255, 128, 0),
    (255, 170, 0),
    (255, 213, 0),
    (255, 255, 0),
    (212, 255, 0),
    (170, 255, 0),
    (128, 255, 0),
    (0, 255, 0),
    (0, 255, 85),
    (0, 255, 170),
    (0, 255, 213),
    (0, 255, 255),
    (0, 213, 255),
    (0, 170, 255),
    (127, 0, 255),
    (170, 0, 255),
    (212, 0, 255),
    (255, 0, 255),
    (255, 0, 170),
    (255, 0, 85),
];

pub fn do_log(level: LogLevel, file: &'static str, args: impl FnOnce() -> String) {
    let config = get_diagnostics_config();
    if !is_enabled(level, config.level) {
        return;
    }

    let context = file.strip_suffix(".rs").unwrap_or(file);
    let context = context.rsplit_once('/').map(|(_, x)| x).unwrap_or(context);
    let context = format!("{}:{context}", config.namespace);

    let text = format_text(level, &args());

    let mut stderr = std::io::stderr();

    // Write errors are ignored
    if stderr.is_terminal() {
        let mut hasher = DefaultHasher::new();
        context.hash(&mut hasher);
        let hash = hasher.finish() as usize;
        let (r, g, b) = COLORS[hash % COLORS.len()];
        let _ = writeln!(
            stderr,
            "\x1b[38;2;{r};{g};{b}m[{context:22}]\x1b[0m {}{text}\x1b[0m",
            level.get_prefix_formatting(),
        );
    } else {
        let _ = writeln!(stderr, "[{context:22}] {text}");
    }
}

fn is_enabled(level: LogLevel, threshold: LogLevel) -> bool {
    level >= threshold && level != LogLevel::None
}

fn format_text(level: LogLevel, message: &str) -> String {
    word_wrap(&format!("{}{message}", level.get_prefix_text()))
}

pub fn get_diagnostics_config() -> &'static DiagnosticsConfig {
    DIAGNOSTICS_CONFIG.get().unwrap_or(&DEFAULT_CONFIG)
}

fn word_wrap(text: &str) -> String {
    const NEWLINE: &str = "\n                         ";
    let mut res = String::new();
    let mut line_length = 0;
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            res.push_str(NEWLINE);
            line_length = 0;
        }
        for word in line.split_whitespace() {
            if line_length + 1 + word.len() <= 100 {
                if line_length > 0 {
                    res.push(' ');
                }
                res.push_str(word);
                line_length += 1 + word.len();
            } else {
                res.push_str(NEWLINE);
                res.push_str(word);
                line_length = 1 + word.len();
            }
        }
    }
    res
}

//! Step and key/value output

use super::context::UiContext;
use console::style;

/// Render a byte count for humans ("1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[derive(Clone, Copy)]
enum Level {
    Ok,
    Info,
    Warn,
    Fail,
}

impl Level {
    fn tag(self) -> console::StyledObject<&'static str> {
        match self {
            Level::Ok => style("[OK]").green(),
            Level::Info => style("[INFO]").cyan(),
            Level::Warn => style("[WARN]").yellow(),
            Level::Fail => style("[FAIL]").red(),
        }
    }
}

/// Interactive sessions get cliclack markers; plain mode prints a tag.
/// Warnings and failures go to stderr in plain mode.
fn emit(ctx: &UiContext, level: Level, message: String) {
    if ctx.is_interactive() {
        let _ = match level {
            Level::Ok => cliclack::log::success(message),
            Level::Info => cliclack::log::info(message),
            Level::Warn => cliclack::log::warning(message),
            Level::Fail => cliclack::log::error(message),
        };
        return;
    }
    match level {
        Level::Ok | Level::Info => println!("  {} {}", level.tag(), message),
        Level::Warn | Level::Fail => eprintln!("  {} {}", level.tag(), message),
    }
}

pub fn section(ctx: &UiContext, title: &str) {
    println!();
    let title = style(title).bold();
    if ctx.is_interactive() {
        let _ = cliclack::log::info(title);
    } else {
        println!("{}", title);
    }
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    emit(ctx, Level::Ok, message.to_string());
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(ctx, Level::Ok, format!("{} ({})", message, style(detail).dim()));
}

pub fn step_info(ctx: &UiContext, message: &str) {
    emit(ctx, Level::Info, message.to_string());
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    emit(ctx, Level::Warn, format!("{} - {}", message, style(hint).dim()));
}

pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(ctx, Level::Fail, format!("{}: {}", message, style(detail).red()));
}

pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        let _ = cliclack::log::remark(message);
    } else {
        println!("  {}", style(message).dim());
    }
}

/// Indented `key: value` line, key dimmed on a terminal
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    let key = if ctx.is_interactive() {
        style(key).dim()
    } else {
        style(key)
    };
    println!("  {}: {}", key, value);
}

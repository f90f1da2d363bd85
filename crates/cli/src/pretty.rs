//! Color-coded console output for humans. Logs go through tracing; this is for results.

use std::fmt::Display;

use crossterm::style::{style, Attribute, Color, Stylize};

#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub info: Color,
    pub warn: Color,
    pub err: Color,
    /// Off when `NO_COLOR` is set or `--no-color` is passed.
    pub enabled: bool,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            info: Color::Green,
            warn: Color::Yellow,
            err: Color::Red,
            enabled: std::env::var_os("NO_COLOR").is_none(),
        }
    }
}

impl Printer {
    pub fn plain() -> Self { Self { enabled: false, ..Self::default() } }

    pub fn paint(&self, color: Color, msg: impl Display) -> String {
        if !self.enabled {
            return msg.to_string();
        }
        style(msg.to_string()).with(color).attribute(Attribute::Bold).to_string()
    }

    pub fn info(&self, msg: impl Display) { println!("{}", self.paint(self.info, msg)); }
    pub fn warning(&self, msg: impl Display) { println!("{}", self.paint(self.warn, msg)); }
    pub fn error(&self, msg: impl Display) { eprintln!("{}", self.paint(self.err, msg)); }

    pub fn dim(&self, msg: impl Display) -> String {
        if self.enabled { msg.to_string().dark_grey().to_string() } else { msg.to_string() }
    }
}

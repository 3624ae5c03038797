//! Terminal output helpers for the admin CLI.

use clap::builder::styling::{AnsiColor, Color as ClapColor, Style};
use clap::builder::Styles;
use crossterm::style::{Color, Stylize};
use job_scheduler::JobState;
use unicode_width::UnicodeWidthStr;

const ACCENT: Color = Color::Rgb {
    r: 0,
    g: 200,
    b: 255,
};
const OK: Color = Color::Rgb {
    r: 0,
    g: 230,
    b: 120,
};
const FAIL: Color = Color::Rgb {
    r: 255,
    g: 85,
    b: 85,
};
const PENDING: Color = Color::Rgb {
    r: 255,
    g: 200,
    b: 60,
};
const MUTED: Color = Color::Rgb {
    r: 130,
    g: 130,
    b: 130,
};

fn ansi(color: AnsiColor) -> Option<ClapColor> {
    Some(ClapColor::Ansi(color))
}

pub fn get_styles() -> Styles {
    let heading = Style::new().bold().underline().fg_color(ansi(AnsiColor::Cyan));
    Styles::styled()
        .usage(heading)
        .header(heading)
        .literal(Style::new().bold().fg_color(ansi(AnsiColor::Green)))
        .valid(Style::new().bold().fg_color(ansi(AnsiColor::Green)))
        .invalid(Style::new().bold().fg_color(ansi(AnsiColor::Red)))
        .error(Style::new().bold().fg_color(ansi(AnsiColor::Red)))
        .placeholder(Style::new().fg_color(ansi(AnsiColor::BrightBlack)))
}

/// Colour used for a job state wherever it is printed.
pub fn state_color(state: JobState) -> Color {
    match state {
        JobState::Succeeded => OK,
        JobState::FailedTerminal => FAIL,
        JobState::Leased => ACCENT,
        JobState::Scheduled | JobState::Ready => PENDING,
    }
}

pub fn print_success(message: &str) {
    println!(" {} {}", "✓".with(OK).bold(), message.with(OK));
}

pub fn print_error(message: &str) {
    eprintln!(" {} {}", "✗".with(FAIL).bold(), message.with(FAIL));
}

pub fn print_key_value(key: &str, value: &str) {
    print_key_colored(key, value, Color::Reset);
}

pub fn print_key_colored(key: &str, value: &str, color: Color) {
    println!(
        "  {} {} {}",
        "●".with(ACCENT),
        format!("{}:", key).with(MUTED),
        value.with(color)
    );
}

/// Fixed-header table with rounded borders. Cell widths follow the widest
/// value in each column, measured in terminal columns.
pub struct TableBuilder {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TableBuilder {
    pub fn new(headers: Vec<&str>) -> Self {
        TableBuilder {
            headers: headers.into_iter().map(String::from).collect(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn widths(&self) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                self.rows
                    .iter()
                    .filter_map(|row| row.get(i))
                    .map(|cell| cell.width())
                    .fold(header.width(), usize::max)
            })
            .collect()
    }

    fn border(widths: &[usize], left: &str, mid: &str, right: &str) -> String {
        let segments: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{}{}{}", left, segments.join(mid), right)
    }

    fn line(widths: &[usize], cells: &[String], header: bool) -> String {
        let bar = "│".with(ACCENT).to_string();
        let mut out = bar.clone();
        for (i, width) in widths.iter().enumerate() {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            let padded = format!("{}{}", cell, " ".repeat(width.saturating_sub(cell.width())));
            let styled = if header {
                padded.with(ACCENT).bold().to_string()
            } else {
                padded
            };
            out.push_str(&format!(" {} {}", styled, bar));
        }
        out
    }

    pub fn print(&self) {
        if self.headers.is_empty() {
            return;
        }
        let widths = self.widths();
        println!("{}", Self::border(&widths, "╭", "┬", "╮").with(ACCENT));
        println!("{}", Self::line(&widths, &self.headers, true));
        println!("{}", Self::border(&widths, "├", "┼", "┤").with(ACCENT));
        for row in &self.rows {
            println!("{}", Self::line(&widths, row, false));
        }
        println!("{}", Self::border(&widths, "╰", "┴", "╯").with(ACCENT));
    }
}

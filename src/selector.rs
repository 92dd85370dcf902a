use std::io::{self, BufRead, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
};
use thiserror::Error;
use tracing::debug;
use unicode_truncate::UnicodeTruncateStr;

use crate::config::Config;

/// Entry appended to external picker lists
const QUIT_ENTRY: &str = "Quit";

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to run picker '{0}': {1}. Is it installed and in your PATH?")]
    Launch(String, String),
}

/// A way of asking the user to pick from a list or type some text
pub trait Selector {
    /// Index into `options` of the chosen entry, `None` when the user backs out
    fn select(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>, SelectError>;

    /// Free text, `None` when cancelled or left empty
    fn input(&mut self, prompt: &str) -> Result<Option<String>, SelectError>;
}

pub fn from_config(config: &Config) -> Box<dyn Selector> {
    if config.external_picker {
        Box::new(PickerSelector::new(&config.picker_command))
    } else {
        Box::new(ListSelector)
    }
}

/// Indices of `options` containing `query`, ignoring case
pub fn filter_options(options: &[String], query: &str) -> Vec<usize> {
    let query = query.to_lowercase();
    options
        .iter()
        .enumerate()
        .filter(|(_, o)| query.is_empty() || o.to_lowercase().contains(&query))
        .map(|(i, _)| i)
        .collect()
}

/// State of the filterable list between key presses
struct FilterList<'a> {
    options: &'a [String],
    query: String,
    visible: Vec<usize>,
    cursor: usize,
}

enum KeyOutcome {
    Continue,
    Picked(usize),
    Cancelled,
}

impl<'a> FilterList<'a> {
    fn new(options: &'a [String]) -> Self {
        Self {
            options,
            query: String::new(),
            visible: filter_options(options, ""),
            cursor: 0,
        }
    }

    fn refilter(&mut self) {
        self.visible = filter_options(self.options, &self.query);
        self.cursor = self.cursor.min(self.visible.len().saturating_sub(1));
    }

    fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> KeyOutcome {
        match code {
            KeyCode::Esc => KeyOutcome::Cancelled,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => KeyOutcome::Cancelled,
            KeyCode::Enter => match self.visible.get(self.cursor) {
                Some(&index) => KeyOutcome::Picked(index),
                None => KeyOutcome::Continue,
            },
            KeyCode::Up => {
                self.cursor = self.cursor.saturating_sub(1);
                KeyOutcome::Continue
            }
            KeyCode::Down => {
                if self.cursor + 1 < self.visible.len() {
                    self.cursor += 1;
                }
                KeyOutcome::Continue
            }
            KeyCode::Backspace => {
                self.query.pop();
                self.refilter();
                KeyOutcome::Continue
            }
            KeyCode::Char(c) => {
                self.query.push(c);
                self.refilter();
                KeyOutcome::Continue
            }
            _ => KeyOutcome::Continue,
        }
    }
}

fn restore_terminal() {
    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen);
}

/// Built-in full-screen list with a live filter
pub struct ListSelector;

impl ListSelector {
    fn draw(frame: &mut Frame, prompt: &str, list: &FilterList) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Prompt + filter
                Constraint::Min(0),    // Options
                Constraint::Length(1), // Help
            ])
            .split(frame.area());

        let header = Paragraph::new(Line::from(vec![
            Span::styled(format!("{} ", prompt), Style::default().fg(Color::Cyan)),
            Span::raw(list.query.as_str()),
        ]))
        .block(Block::default().borders(Borders::BOTTOM));
        frame.render_widget(header, chunks[0]);

        let width = chunks[1].width.saturating_sub(4) as usize;
        let items: Vec<ListItem> = list
            .visible
            .iter()
            .map(|&i| {
                let (label, _) = list.options[i].unicode_truncate(width);
                ListItem::new(label.to_string())
            })
            .collect();

        let title = format!("{}/{}", list.visible.len(), list.options.len());
        let widget = List::new(items)
            .block(Block::default().borders(Borders::ALL).title(title))
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            );

        let mut state = ListState::default();
        if !list.visible.is_empty() {
            state.select(Some(list.cursor));
        }
        frame.render_stateful_widget(widget, chunks[1], &mut state);

        let help = Paragraph::new("type to filter | ↑/↓: navigate | Enter: select | Esc: back")
            .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(help, chunks[2]);
    }

    fn run_list(
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
        prompt: &str,
        options: &[String],
    ) -> io::Result<Option<usize>> {
        let mut list = FilterList::new(options);

        loop {
            terminal.draw(|f| Self::draw(f, prompt, &list))?;

            if !event::poll(Duration::from_millis(200))? {
                continue;
            }
            if let Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
            {
                match list.handle_key(key.code, key.modifiers) {
                    KeyOutcome::Continue => {}
                    KeyOutcome::Picked(index) => return Ok(Some(index)),
                    KeyOutcome::Cancelled => return Ok(None),
                }
            }
        }
    }
}

impl Selector for ListSelector {
    fn select(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>, SelectError> {
        if options.is_empty() {
            return Ok(None);
        }

        enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(e) = execute!(stdout, EnterAlternateScreen) {
            restore_terminal();
            return Err(e.into());
        }

        let result = Terminal::new(CrosstermBackend::new(stdout))
            .and_then(|mut terminal| {
                let picked = Self::run_list(&mut terminal, prompt, options);
                let _ = terminal.show_cursor();
                picked
            });

        restore_terminal();
        Ok(result?)
    }

    fn input(&mut self, prompt: &str) -> Result<Option<String>, SelectError> {
        print!("{}: ", prompt);
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }
}

/// Map a picker's printed choice back to an option index
pub fn match_choice(options: &[String], output: &str) -> Option<usize> {
    let choice = output.trim();
    if choice.is_empty() || choice == QUIT_ENTRY {
        return None;
    }
    options.iter().position(|o| o == choice)
}

/// External dmenu-style picker (rofi by default)
pub struct PickerSelector {
    command: String,
}

impl PickerSelector {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    fn run_picker(&self, prompt: &str, lines: &str) -> Result<String, SelectError> {
        let launch_error = |e: io::Error| SelectError::Launch(self.command.clone(), e.to_string());

        let mut child = Command::new(&self.command)
            .args(["-dmenu", "-i", "-p", prompt])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(launch_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(lines.as_bytes())?;
        }

        // A non-zero exit means the picker was dismissed; its output is empty then
        let output = child.wait_with_output()?;
        debug!(status = %output.status, "picker finished");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Selector for PickerSelector {
    fn select(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>, SelectError> {
        let mut lines: Vec<&str> = options
            .iter()
            .map(|o| o.as_str())
            .collect();
        lines.push(QUIT_ENTRY);

        let output = self.run_picker(prompt, &lines.join("\n"))?;
        Ok(match_choice(options, &output))
    }

    fn input(&mut self, prompt: &str) -> Result<Option<String>, SelectError> {
        let output = self.run_picker(prompt, "")?;
        let text = output.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<String> {
        vec![
            "Show S01E01.mkv (1.0 GB)".to_string(),
            "Show S01E02.mkv (1.1 GB)".to_string(),
            "Other Movie.mp4 (700.0 MB)".to_string(),
        ]
    }

    #[test]
    fn test_filter_options() {
        let opts = options();
        assert_eq!(filter_options(&opts, ""), vec![0, 1, 2]);
        assert_eq!(filter_options(&opts, "s01e02"), vec![1]);
        assert_eq!(filter_options(&opts, "SHOW"), vec![0, 1]);
        assert!(filter_options(&opts, "nothing").is_empty());
    }

    #[test]
    fn test_filter_list_navigation() {
        let opts = options();
        let mut list = FilterList::new(&opts);

        list.handle_key(KeyCode::Down, KeyModifiers::NONE);
        list.handle_key(KeyCode::Down, KeyModifiers::NONE);
        list.handle_key(KeyCode::Down, KeyModifiers::NONE);
        assert_eq!(list.cursor, 2);

        for c in "show".chars() {
            list.handle_key(KeyCode::Char(c), KeyModifiers::NONE);
        }
        // Cursor is clamped to the shorter list
        assert_eq!(list.cursor, 1);
        assert!(matches!(
            list.handle_key(KeyCode::Enter, KeyModifiers::NONE),
            KeyOutcome::Picked(1)
        ));
    }

    #[test]
    fn test_filter_list_cancel_and_empty_enter() {
        let opts = options();
        let mut list = FilterList::new(&opts);
        for c in "zzz".chars() {
            list.handle_key(KeyCode::Char(c), KeyModifiers::NONE);
        }
        assert!(matches!(
            list.handle_key(KeyCode::Enter, KeyModifiers::NONE),
            KeyOutcome::Continue
        ));
        assert!(matches!(
            list.handle_key(KeyCode::Char('c'), KeyModifiers::CONTROL),
            KeyOutcome::Cancelled
        ));
        assert!(matches!(
            list.handle_key(KeyCode::Esc, KeyModifiers::NONE),
            KeyOutcome::Cancelled
        ));
    }

    #[test]
    fn test_match_choice() {
        let opts = options();
        assert_eq!(match_choice(&opts, "Show S01E02.mkv (1.1 GB)\n"), Some(1));
        assert_eq!(match_choice(&opts, "Quit\n"), None);
        assert_eq!(match_choice(&opts, ""), None);
        assert_eq!(match_choice(&opts, "typed something else"), None);
    }
}

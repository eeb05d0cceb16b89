use std::io::stdout;
use std::time::Duration;

use crate::clock::CancelToken;
use crate::gui::error::GuiError;
use crate::session::PortSelector;

use crossterm::{
    event::{self, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use log::error;
use ratatui::{
    prelude::*,
    widgets::{
        block::{Position, Title},
        *,
    },
    Terminal,
};

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Done(usize, usize),
    Quit,
}

/// Cursor and picks over a fixed list of ports.
#[derive(Debug)]
struct Picker {
    cursor: usize,
    first: Option<usize>,
    len: usize,
}

impl Picker {
    fn new(len: usize) -> Self {
        Self {
            cursor: 0,
            first: None,
            len,
        }
    }

    fn key(&mut self, code: KeyCode) -> Step {
        match code {
            KeyCode::Down => self.cursor = (self.cursor + 1) % self.len,
            KeyCode::Up => self.cursor = (self.cursor + self.len - 1) % self.len,
            KeyCode::Enter => match self.first {
                None => self.first = Some(self.cursor),
                Some(first) if first != self.cursor => return Step::Done(first, self.cursor),
                Some(_) => {}
            },
            KeyCode::Backspace => self.first = None,
            KeyCode::Char('q') | KeyCode::Esc => return Step::Quit,
            _ => {}
        }
        Step::Continue
    }

    fn prompt(&self) -> &'static str {
        if self.first.is_none() {
            " Select the first sock "
        } else {
            " Select the second sock "
        }
    }
}

/// Let the operator pick two distinct ports in a full-screen list.
///
/// Returns `None` when they quit or `cancel` fires.
pub fn port_selector(
    ports: &[String],
    cancel: &CancelToken,
) -> Result<Option<(String, String)>, GuiError> {
    if ports.len() < 2 {
        return Err(GuiError::NotEnoughPorts(ports.len()));
    }

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let result = pick(ports, cancel);
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(result?.map(|(a, b)| (ports[a].clone(), ports[b].clone())))
}

fn pick(ports: &[String], cancel: &CancelToken) -> Result<Option<(usize, usize)>, GuiError> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut picker = Picker::new(ports.len());
    let mut list_state = ListState::default();
    while !cancel.is_cancelled() {
        let title = Title::from(picker.prompt().magenta().bold());
        let instructions = Title::from(Line::from(vec![
            " Navigate ".into(),
            "<Up>/<Down>".magenta().bold(),
            " Select ".into(),
            "<Enter>".magenta().bold(),
            " Undo ".into(),
            "<Backspace>".magenta().bold(),
            " Quit ".into(),
            "<Q> ".magenta().bold(),
        ]));
        let block = Block::default()
            .title(title.alignment(Alignment::Center))
            .title(
                instructions
                    .alignment(Alignment::Center)
                    .position(Position::Bottom),
            )
            .borders(Borders::ALL);
        let items = ports.iter().enumerate().map(|(i, port)| {
            if picker.first == Some(i) {
                format!("[1] {}", port)
            } else {
                format!("    {}", port)
            }
        });
        let list = List::new(items)
            .style(Style::default().fg(Color::White))
            .highlight_symbol(">>")
            .highlight_style(Style::default().fg(Color::Magenta))
            .block(block);
        list_state.select(Some(picker.cursor));
        terminal.draw(|frame| {
            let area = frame.size();
            frame.render_stateful_widget(list, area, &mut list_state);
        })?;

        if event::poll(Duration::from_millis(16))? {
            if let event::Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match picker.key(key.code) {
                        Step::Continue => {}
                        Step::Done(a, b) => return Ok(Some((a, b))),
                        Step::Quit => return Ok(None),
                    }
                }
            }
        }
    }
    Ok(None)
}

/// [`PortSelector`] backed by [`port_selector`].
#[derive(Debug, Default)]
pub struct TuiPortSelector;

impl PortSelector for TuiPortSelector {
    fn select(&self, ports: &[String], cancel: &CancelToken) -> Option<(String, String)> {
        port_selector(ports, cancel).unwrap_or_else(|e| {
            error!("Port selection failed: {}", e);
            None
        })
    }
}

//! Live results table with progress display

use crate::proxy::models::{display_name, ProbeResult};
use crate::proxy::sink::ResultSink;
use crate::tui::{address_cell, Summary};
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tokio::time::Duration;

/// Probe results TUI application state
pub struct ProbeApp {
    /// Reorders incoming results into node order
    sink: ResultSink,
    /// Rows shown so far, in node order
    rows: Vec<ProbeResult>,
    summary: Summary,
    /// Width of the name column
    name_width: usize,
    list_state: ListState,
    status_message: String,
    is_complete: bool,
    should_quit: bool,
}

impl ProbeApp {
    pub fn new(nodes: Vec<String>) -> Self {
        let name_width = nodes
            .iter()
            .map(|n| display_name(n).chars().count())
            .max()
            .unwrap_or(0);

        Self {
            sink: ResultSink::new(nodes),
            rows: Vec::new(),
            summary: Summary::default(),
            name_width,
            list_state: ListState::default(),
            status_message: "Testing nodes... Press 'q' to quit.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    /// Run the TUI until the user quits; returns the rows shown
    pub async fn run(mut self, rx: UnboundedReceiver<ProbeResult>) -> Result<Vec<ProbeResult>> {
        // Setup terminal
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal, rx).await;

        // Restore terminal
        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result.map(|()| self.rows)
    }

    async fn run_app<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        mut rx: UnboundedReceiver<ProbeResult>,
    ) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            if !self.is_complete {
                loop {
                    match rx.try_recv() {
                        Ok(result) => self.record(result),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            self.finish();
                            break;
                        }
                    }
                }
            }

            // Keep the event loop cooperative with the probe tasks
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    fn record(&mut self, result: ProbeResult) {
        self.sink.push(result);
        for row in self.sink.drain_ready() {
            self.summary.add(&row);
            self.rows.push(row);
        }

        let total = self.sink.total();
        let percentage = (self.sink.received() as f64 / total.max(1) as f64 * 100.0) as u32;
        self.status_message = format!(
            "Testing... {}% ({}/{}) | IPv4: {} | IPv6: {}",
            percentage,
            self.sink.received(),
            total,
            self.summary.ipv4,
            self.summary.ipv6
        );
    }

    fn finish(&mut self) {
        self.is_complete = true;
        self.status_message = format!("Complete! {} | Press 'q' to quit", self.summary);
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Down => {
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < self.rows.len() => i + 1,
                    Some(_) => 0,
                    None => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let i = match self.list_state.selected() {
                    Some(0) | None => self.rows.len().saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Results
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Node IPv4 / IPv6 Test")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let total = self.sink.total();
        let received = self.sink.received();
        let progress = if total > 0 {
            (received as f64 / total as f64 * 100.0) as u16
        } else {
            100
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress.min(100))
            .label(format!("{}/{} ({}%)", received, total, progress));
        f.render_widget(gauge, chunks[1]);

        let items: Vec<ListItem> = self
            .rows
            .iter()
            .map(|row| ListItem::new(self.row_line(row)))
            .collect();

        let block_title = format!(
            "Test Result ({} shown, {} pending)",
            self.rows.len(),
            self.sink.pending().len()
        );
        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(block_title)
                    .border_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");
        f.render_stateful_widget(list, chunks[2], &mut self.list_state);

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn row_line(&self, row: &ProbeResult) -> Line<'static> {
        let name = format!("{:>width$}", display_name(&row.node), width = self.name_width);
        Line::from(vec![
            Span::styled(name, Style::default().fg(Color::Cyan)),
            Span::raw("  "),
            address_span(row.ipv4.as_deref()),
            Span::raw("  "),
            address_span(row.ipv6.as_deref()),
        ])
    }
}

fn address_span(address: Option<&str>) -> Span<'static> {
    let color = if address.is_some() { Color::Green } else { Color::Red };
    Span::styled(format!("{:<42}", address_cell(address)), Style::default().fg(color))
}

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout as Split, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink};
use crate::cancel::CancelToken;
use crate::domain::DatasetState;
use crate::error::IngestError;
use crate::output::format_bytes;

const LOGS_MAX: usize = 200;
const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone)]
struct DatasetRow {
    dataset: String,
    state: DatasetState,
    message: String,
    written: u64,
    total: Option<u64>,
    tables: usize,
    rows: u64,
    failed: Option<bool>,
}

impl DatasetRow {
    fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            state: DatasetState::Pending,
            message: String::new(),
            written: 0,
            total: None,
            tables: 0,
            rows: 0,
            failed: None,
        }
    }
}

#[derive(Debug)]
struct DashboardState {
    rows: Vec<DatasetRow>,
    logs: VecDeque<String>,
    started: Instant,
    cancelling: bool,
}

impl DashboardState {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            logs: VecDeque::new(),
            started: Instant::now(),
            cancelling: false,
        }
    }

    fn row_mut(&mut self, dataset: &str) -> &mut DatasetRow {
        let idx = match self.rows.iter().position(|row| row.dataset == dataset) {
            Some(idx) => idx,
            None => {
                self.rows.push(DatasetRow::new(dataset));
                self.rows.len() - 1
            }
        };
        &mut self.rows[idx]
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::State {
                dataset,
                state,
                message,
            } => {
                let row = self.row_mut(&dataset);
                row.state = state;
                row.message = message.clone();
                self.push_log(format!("{dataset}: {message}"));
            }
            ProgressEvent::Transfer {
                dataset,
                written,
                total,
            } => {
                let row = self.row_mut(&dataset);
                row.written = written;
                row.total = total;
            }
            ProgressEvent::Table {
                dataset,
                table,
                rows,
            } => {
                let row = self.row_mut(&dataset);
                row.tables += 1;
                row.rows += rows;
                row.message = format!("loaded {table}");
                self.push_log(format!("{dataset}: {table} <- {rows} rows"));
            }
            ProgressEvent::Finished {
                dataset,
                failed,
                message,
                elapsed,
            } => {
                let row = self.row_mut(&dataset);
                row.failed = Some(failed);
                row.state = if failed {
                    DatasetState::Failed
                } else {
                    DatasetState::Loaded
                };
                row.message = message.clone();
                self.push_log(format!(
                    "{dataset}: {} in {:.1}s ({message})",
                    if failed { "failed" } else { "done" },
                    elapsed.as_secs_f64()
                ));
            }
        }
    }

    fn push_log(&mut self, item: String) {
        let secs = self.started.elapsed().as_secs();
        self.logs
            .push_back(format!("[{:02}:{:02}] {item}", secs / 60, secs % 60));
        while self.logs.len() > LOGS_MAX {
            self.logs.pop_front();
        }
    }
}

struct TuiProgress {
    state: Arc<Mutex<DashboardState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.apply(event);
        }
    }
}

pub struct Tui {
    cancel: CancelToken,
    state: Arc<Mutex<DashboardState>>,
}

impl Tui {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            state: Arc::new(Mutex::new(DashboardState::new())),
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, IngestError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let outcome = loop {
            if let Ok(state) = self.state.lock() {
                if let Err(err) = terminal.draw(|frame| draw_ui(frame, &state)) {
                    break Err(miette::Report::msg(err.to_string()));
                }
            }

            match rx.try_recv() {
                Ok(result) => break result.map_err(miette::Report::new),
                Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                    break Err(miette::Report::msg("ingestion worker stopped unexpectedly"));
                }
                Err(std::sync::mpsc::TryRecvError::Empty) => {}
            }

            match event::poll(Duration::from_millis(120)) {
                Ok(true) => {
                    if let Ok(Event::Key(key)) = event::read() {
                        self.handle_key(key);
                    }
                }
                Ok(false) => {}
                Err(err) => break Err(miette::Report::msg(err.to_string())),
            }
        };

        restore_terminal()?;
        if outcome.is_err() {
            self.cancel.cancel();
        }
        handle.join().ok();
        outcome
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        let interrupt = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
        if !interrupt {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if !state.cancelling {
                state.cancelling = true;
                state.push_log("cancellation requested, finishing current step".to_string());
            }
        }
        self.cancel.cancel();
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, state: &DashboardState) {
    let chunks = Split::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(10),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state), chunks[0]);
    draw_datasets(frame, state, chunks[1]);
    frame.render_widget(draw_logs(state, chunks[2]), chunks[2]);

    let footer = if state.cancelling {
        Span::styled(
            "cancelling... waiting for the current step to unwind",
            Style::default().fg(Color::Yellow),
        )
    } else {
        Span::styled("q / Esc: cancel", Style::default().fg(Color::Gray))
    };
    frame.render_widget(Paragraph::new(Line::from(footer)), chunks[3]);
}

fn draw_header(state: &DashboardState) -> Paragraph<'static> {
    let done = state.rows.iter().filter(|row| row.failed.is_some()).count();
    let failed = state.rows.iter().filter(|row| row.failed == Some(true)).count();
    let rows: u64 = state.rows.iter().map(|row| row.rows).sum();
    let elapsed = state.started.elapsed().as_secs();
    let title = Line::from(vec![
        Span::styled(
            "GOVDATA",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!(
            "   elapsed {:02}:{:02}",
            elapsed / 60,
            elapsed % 60
        )),
    ]);
    let summary = Line::from(vec![
        Span::styled(
            format!("datasets {done} finished"),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(
            format!("   failed {failed}"),
            Style::default().fg(if failed > 0 { Color::Red } else { Color::Gray }),
        ),
        Span::styled(format!("   rows {rows}"), Style::default().fg(Color::Gray)),
    ]);
    Paragraph::new(vec![title, summary])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_datasets(frame: &mut ratatui::Frame, state: &DashboardState, area: Rect) {
    let mut lines = vec![Line::from(Span::styled(
        format!(
            "{:<12} {:<10} {:<32} {:>6} {:>10}  STATUS",
            "DATASET", "STATE", "TRANSFER", "TABLES", "ROWS"
        ),
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    ))];
    for row in &state.rows {
        let color = match row.failed {
            Some(true) => Color::Red,
            Some(false) => Color::Green,
            None => Color::Yellow,
        };
        lines.push(Line::from(vec![
            Span::raw(format!("{:<12} ", row.dataset)),
            Span::styled(format!("{:<10} ", row.state), Style::default().fg(color)),
            Span::raw(format!("{:<32} ", transfer_label(row))),
            Span::raw(format!("{:>6} {:>10}  ", row.tables, row.rows)),
            Span::styled(row.message.clone(), Style::default().fg(Color::Gray)),
        ]));
    }
    let view = Paragraph::new(lines)
        .block(Block::default().borders(Borders::BOTTOM))
        .wrap(Wrap { trim: false });
    frame.render_widget(view, area);
}

fn draw_logs(state: &DashboardState, area: Rect) -> Paragraph<'static> {
    let visible = usize::from(area.height.saturating_sub(1));
    let lines = state
        .logs
        .iter()
        .skip(state.logs.len().saturating_sub(visible))
        .map(|line| Line::from(line.clone()))
        .collect::<Vec<_>>();
    Paragraph::new(lines).block(Block::default().title("Log").borders(Borders::TOP))
}

fn transfer_label(row: &DatasetRow) -> String {
    if row.written == 0 {
        return String::new();
    }
    match row.total {
        Some(total) if total > 0 => {
            let percent = (row.written.saturating_mul(100) / total).min(100) as u8;
            format!("{} {percent:>3}%", progress_bar(percent))
        }
        _ => format_bytes(row.written),
    }
}

fn progress_bar(percent: u8) -> String {
    let filled = (percent as usize * BAR_WIDTH) / 100;
    let mut out = String::from("[");
    for i in 0..BAR_WIDTH {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

//! Terminal dashboard for the relay server
//!
//! Two scrollable panes (sessions and activity log) over the shared
//! [`Metrics`], redrawn on a tick and on every key press.

use crate::config::RelayConfig;
use crate::metrics::{truncate_id, LogLevel, Metrics, ServerStatus};
use crate::network::{self, NetworkEvent};
use chrono::Local;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::StreamExt;
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Row, Table},
    Frame,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TICK: Duration = Duration::from_millis(250);

const PAGE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Pane {
    #[default]
    Sessions,
    Log,
}

/// Focus and scroll offsets
#[derive(Debug, Default)]
struct View {
    focus: Pane,
    session_offset: usize,
    /// Entries hidden below the bottom of the log, 0 follows new entries
    log_offset: usize,
}

impl View {
    /// Apply a key press. Returns true when the user asked to quit.
    fn handle_key(&mut self, key: KeyEvent, log_len: usize, session_len: usize) -> bool {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Tab | KeyCode::BackTab => {
                self.focus = match self.focus {
                    Pane::Sessions => Pane::Log,
                    Pane::Log => Pane::Sessions,
                };
            }
            code => {
                // The log grows at the bottom, so "up" moves further back in time
                let (offset, len, toward_older) = match self.focus {
                    Pane::Sessions => (&mut self.session_offset, session_len, false),
                    Pane::Log => (&mut self.log_offset, log_len, true),
                };
                let last = len.saturating_sub(1);
                let step = |n: usize, up: bool| -> isize {
                    if up == toward_older {
                        n as isize
                    } else {
                        -(n as isize)
                    }
                };
                let delta = match code {
                    KeyCode::Up | KeyCode::Char('k') => Some(step(1, true)),
                    KeyCode::Down | KeyCode::Char('j') => Some(step(1, false)),
                    KeyCode::PageUp => Some(step(PAGE, true)),
                    KeyCode::PageDown => Some(step(PAGE, false)),
                    KeyCode::Home | KeyCode::Char('g') => {
                        *offset = if toward_older { last } else { 0 };
                        None
                    }
                    KeyCode::End | KeyCode::Char('G') => {
                        *offset = if toward_older { 0 } else { last };
                        None
                    }
                    _ => None,
                };
                if let Some(delta) = delta {
                    *offset = offset.saturating_add_signed(delta).min(last);
                }
            }
        }
        false
    }

    fn following(&self) -> bool {
        self.log_offset == 0
    }
}

/// Run the dashboard until the user quits
pub async fn run(metrics: Arc<RwLock<Metrics>>, config: RelayConfig) -> Result<(), Box<dyn Error>> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<NetworkEvent>();

    let network_metrics = Arc::clone(&metrics);
    let network = tokio::spawn(async move {
        if let Err(e) = network::run_with_dashboard(Arc::clone(&network_metrics), config, event_tx).await {
            let mut m = network_metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Relay stopped: {}", e));
        }
    });

    let mut terminal = ratatui::try_init()?;
    let mut keys = EventStream::new();
    let mut tick = tokio::time::interval(TICK);
    let mut view = View::default();

    let result: Result<(), Box<dyn Error>> = loop {
        if let Err(e) = terminal.draw(|f| draw(f, &metrics.read(), &view)) {
            break Err(e.into());
        }

        tokio::select! {
            _ = tick.tick() => {}
            Some(event) = event_rx.recv() => match event {
                NetworkEvent::Ready { addr } => {
                    metrics.write().log(LogLevel::Info, format!("Accepting sessions on {}", addr));
                }
            },
            key = keys.next() => match key {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    let (log_len, session_len) = {
                        let m = metrics.read();
                        (m.logs.len(), m.sessions().len())
                    };
                    if view.handle_key(key, log_len, session_len) {
                        break Ok(());
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
        }
    };

    ratatui::restore();
    network.abort();
    result
}

fn draw(f: &mut Frame, m: &Metrics, view: &View) {
    let [header, stats, middle, log, footer] = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(6),
        Constraint::Min(6),
        Constraint::Min(6),
        Constraint::Length(1),
    ])
    .margin(1)
    .areas(f.area());

    draw_header(f, header, m);
    draw_stats(f, stats, m);

    let [sessions, kinds] =
        Layout::horizontal([Constraint::Percentage(65), Constraint::Percentage(35)]).areas(middle);
    draw_sessions(f, sessions, m, view);
    draw_kinds(f, kinds, m);
    draw_log(f, log, m, view);
    draw_footer(f, footer, view);
}

fn pane_block(title: String, focused: bool) -> Block<'static> {
    let block = Block::default().borders(Borders::ALL).title(title);
    if focused {
        block.border_style(Style::default().fg(Color::Cyan))
    } else {
        block
    }
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status, color) = match m.status {
        ServerStatus::Starting => ("STARTING", Color::Yellow),
        ServerStatus::Running => ("RUNNING", Color::Green),
        ServerStatus::Error => ("ERROR", Color::Red),
    };
    let addr = m
        .listen_addr
        .as_deref()
        .map(|a| format!("ws://{}", a))
        .unwrap_or_else(|| "binding...".to_string());

    let line = Line::from(vec![
        "Beat Sync Relay".bold(),
        Span::raw("  "),
        Span::styled(status, Style::default().fg(color)),
        Span::raw("  up "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
        Span::raw("  "),
        addr.into(),
    ]);
    f.render_widget(Paragraph::new(line).block(Block::default().borders(Borders::ALL)), area);
}

fn stat(label: &str, value: String, color: Color) -> Line<'static> {
    Line::from(vec![
        Span::raw(format!("{:<10}", label)),
        Span::styled(value, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ])
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let [peers, traffic, limits] = Layout::horizontal([Constraint::Ratio(1, 3); 3]).areas(area);

    let token_color = if m.token_count == 0 { Color::Red } else { Color::White };
    let blocks = [
        (
            " Peers ",
            vec![
                stat("active", format!("{} in {} session(s)", m.active_connections, m.active_sessions), Color::Green),
                stat("peak", m.peak_connections.to_string(), Color::Magenta),
                stat("total", m.total_connections.to_string(), Color::White),
                stat("refused", m.refused_handshakes.to_string(), Color::Red),
            ],
            peers,
        ),
        (
            " Traffic ",
            vec![
                stat("relayed", m.messages_relayed.to_string(), Color::Green),
                stat("rejected", m.messages_rejected.to_string(), Color::Red),
                stat("dropped", m.messages_dropped.to_string(), Color::Yellow),
                stat("sent", human_bytes(m.bytes_relayed), Color::Cyan),
            ],
            traffic,
        ),
        (
            " Limits ",
            vec![
                stat("tokens", m.token_count.to_string(), token_color),
                stat("max frame", human_bytes(m.max_message_bytes as u64), Color::White),
            ],
            limits,
        ),
    ];
    for (title, lines, area) in blocks {
        f.render_widget(
            Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
            area,
        );
    }
}

fn draw_sessions(f: &mut Frame, area: Rect, m: &Metrics, view: &View) {
    let now = Local::now();
    let sessions = m.sessions();
    let items: Vec<ListItem> = sessions
        .iter()
        .skip(view.session_offset)
        .map(|(session_id, connections)| {
            let oldest = connections
                .iter()
                .map(|c| now.signed_duration_since(c.connected_at).num_minutes())
                .max()
                .unwrap_or(0);
            let addrs: Vec<&str> = connections.iter().map(|c| c.remote_addr.as_str()).collect();
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<20}", truncate_id(session_id)), Style::default().fg(Color::Yellow)),
                Span::raw(format!("{:>3} peer(s) {:>4}m  ", connections.len(), oldest)),
                Span::styled(addrs.join(", "), Style::default().fg(Color::DarkGray)),
            ]))
        })
        .collect();

    let title = format!(" Sessions ({}) ", sessions.len());
    f.render_widget(List::new(items).block(pane_block(title, view.focus == Pane::Sessions)), area);
}

fn draw_kinds(f: &mut Frame, area: Rect, m: &Metrics) {
    let rows = m
        .relayed_by_kind
        .iter()
        .map(|(kind, count)| Row::new(vec![kind.to_string(), count.to_string()]));
    let table = Table::new(rows, [Constraint::Min(14), Constraint::Length(10)])
        .header(Row::new(vec!["kind", "relayed"]).style(Style::default().add_modifier(Modifier::UNDERLINED)))
        .block(Block::default().borders(Borders::ALL).title(" Messages "));
    f.render_widget(table, area);
}

fn draw_log(f: &mut Frame, area: Rect, m: &Metrics, view: &View) {
    let height = area.height.saturating_sub(2) as usize;
    let end = m.logs.len().saturating_sub(view.log_offset);
    let start = end.saturating_sub(height);

    let items: Vec<ListItem> = m
        .logs
        .range(start..end)
        .map(|entry| {
            let color = match entry.level {
                LogLevel::Info => Color::Blue,
                LogLevel::Warning => Color::Yellow,
                LogLevel::Error => Color::Red,
                LogLevel::Connection => Color::Green,
                LogLevel::Relay => Color::Magenta,
            };
            ListItem::new(Line::from(vec![
                Span::styled(entry.timestamp.format("%H:%M:%S ").to_string(), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("{:<6}", entry.level.as_str()), Style::default().fg(color)),
                Span::raw(entry.message.clone()),
            ]))
        })
        .collect();

    let title = if view.following() {
        " Activity ".to_string()
    } else {
        format!(" Activity (-{}) ", view.log_offset)
    };
    f.render_widget(List::new(items).block(pane_block(title, view.focus == Pane::Log)), area);
}

fn draw_footer(f: &mut Frame, area: Rect, view: &View) {
    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Black).bg(Color::White));
    let focus = match view.focus {
        Pane::Sessions => "sessions",
        Pane::Log => "activity",
    };
    let footer = Line::from(vec![
        key(" q "),
        Span::raw(" quit  "),
        key(" tab "),
        Span::raw(format!(" focus: {}  ", focus)),
        key(" ↑↓ pgup/pgdn "),
        Span::raw(" scroll  "),
        key(" end "),
        Span::raw(" follow"),
    ]);
    f.render_widget(Paragraph::new(footer), area);
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
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

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;

    fn press(view: &mut View, code: KeyCode) -> bool {
        view.handle_key(KeyEvent::new(code, KeyModifiers::NONE), 30, 4)
    }

    #[test]
    fn test_log_scrolls_back_and_follows_again() {
        let mut view = View::default();
        press(&mut view, KeyCode::Tab);
        assert_eq!(view.focus, Pane::Log);

        press(&mut view, KeyCode::Up);
        press(&mut view, KeyCode::PageUp);
        assert_eq!(view.log_offset, 11);
        assert!(!view.following());

        press(&mut view, KeyCode::Home);
        assert_eq!(view.log_offset, 29);
        press(&mut view, KeyCode::PageUp);
        assert_eq!(view.log_offset, 29);

        press(&mut view, KeyCode::End);
        assert!(view.following());
        press(&mut view, KeyCode::Down);
        assert_eq!(view.log_offset, 0);
    }

    #[test]
    fn test_session_pane_scrolls_downwards() {
        let mut view = View::default();
        press(&mut view, KeyCode::Down);
        press(&mut view, KeyCode::Char('j'));
        assert_eq!(view.session_offset, 2);
        press(&mut view, KeyCode::PageDown);
        assert_eq!(view.session_offset, 3);
        press(&mut view, KeyCode::Char('g'));
        assert_eq!(view.session_offset, 0);
        // Log offset is untouched
        assert_eq!(view.log_offset, 0);
    }

    #[test]
    fn test_quit_keys() {
        let mut view = View::default();
        assert!(press(&mut view, KeyCode::Char('q')));
        assert!(press(&mut view, KeyCode::Esc));
        assert!(view.handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL), 0, 0));
        assert!(!press(&mut view, KeyCode::Char('c')));
    }

    #[test]
    fn test_draw_shows_sessions_and_kinds() {
        let mut m = Metrics::new();
        m.status = ServerStatus::Running;
        m.connection_established(1, "lounge", "10.0.0.1:5000".into(), 1);
        m.connection_established(2, "lounge", "10.0.0.2:5000".into(), 1);
        m.message_relayed("stateSnapshot", 120, 1, 0);

        let mut terminal = Terminal::new(TestBackend::new(120, 40)).unwrap();
        terminal.draw(|f| draw(f, &m, &View::default())).unwrap();

        let screen: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(screen.contains("Beat Sync Relay"));
        assert!(screen.contains("Sessions (1)"));
        assert!(screen.contains("lounge"));
        assert!(screen.contains("stateSnapshot"));
        assert!(screen.contains("RUNNING"));
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(64 * 1024), "64.0 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}

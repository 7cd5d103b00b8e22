//! Terminal dashboard for the timer node

use crate::metrics::{format_elapsed, truncate_peer_id, LogLevel, Metrics, NodeStatus};
use crate::node::{self, NodeCommand, NodeOptions};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use cuetimer_core::sync::{SignalQuality, TimerPhase};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Dashboard state for scrolling etc.
struct DashboardState {
    /// Log scroll position (0 = most recent at bottom)
    log_scroll: usize,
    /// Whether auto-scroll is enabled (follows new logs)
    auto_scroll: bool,
}

/// Run the dashboard
pub async fn run(options: NodeOptions, metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let (command_tx, command_rx) = mpsc::unbounded_channel::<NodeCommand>();

    // Start the session in background
    let metrics_for_node = Arc::clone(&metrics);
    tokio::spawn(async move {
        let result = node::run_with_dashboard(options, Arc::clone(&metrics_for_node), command_rx).await;
        if let Err(e) = result {
            let mut m = metrics_for_node.write();
            m.status = NodeStatus::Error;
            m.log(LogLevel::Error, format!("Node stopped: {}", e));
        }
    });

    let mut state = DashboardState {
        log_scroll: 0,
        auto_scroll: true,
    };

    // Fast enough for a readable running clock
    let tick_rate = Duration::from_millis(50);
    let mut should_quit = false;

    while !should_quit {
        if state.auto_scroll {
            state.log_scroll = 0;
        }

        terminal.draw(|f| draw(f, &metrics, &state))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let log_count = metrics.read().logs.len();

                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => should_quit = true,
                        KeyCode::Char('c') if key.modifiers.contains(event::KeyModifiers::CONTROL) => {
                            should_quit = true
                        }
                        KeyCode::Char(' ') => {
                            let _ = command_tx.send(NodeCommand::StartOrPause);
                        }
                        KeyCode::Char('r') => {
                            let _ = command_tx.send(NodeCommand::Reset);
                        }
                        KeyCode::Char('s') => {
                            let _ = command_tx.send(NodeCommand::Hold);
                        }
                        KeyCode::Char('b') => {
                            let _ = command_tx.send(NodeCommand::Burst);
                        }
                        KeyCode::Char('t') => {
                            let _ = command_tx.send(NodeCommand::SwitchRole);
                        }
                        // Scroll up (older logs)
                        KeyCode::Up | KeyCode::Char('k') => {
                            if log_count > 0 {
                                state.log_scroll = (state.log_scroll + 1).min(log_count.saturating_sub(1));
                                state.auto_scroll = false;
                            }
                        }
                        // Scroll down (newer logs)
                        KeyCode::Down | KeyCode::Char('j') => {
                            state.log_scroll = state.log_scroll.saturating_sub(1);
                            if state.log_scroll == 0 {
                                state.auto_scroll = true;
                            }
                        }
                        KeyCode::PageUp => {
                            if log_count > 0 {
                                state.log_scroll = (state.log_scroll + 10).min(log_count.saturating_sub(1));
                                state.auto_scroll = false;
                            }
                        }
                        KeyCode::PageDown => {
                            state.log_scroll = state.log_scroll.saturating_sub(10);
                            if state.log_scroll == 0 {
                                state.auto_scroll = true;
                            }
                        }
                        // End - newest logs (enable auto-scroll)
                        KeyCode::End => {
                            state.log_scroll = 0;
                            state.auto_scroll = true;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    let _ = command_tx.send(NodeCommand::Quit);

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, state: &DashboardState) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(7), // Stats
            Constraint::Length(6), // Peers
            Constraint::Min(8),    // Logs
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);
    draw_peers(f, chunks[2], &m);
    draw_logs(f, chunks[3], &m, state);
    draw_footer(f, chunks[4], state);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status_text, status_style) = match m.status {
        NodeStatus::Starting => ("STARTING", Style::default().fg(Color::Yellow)),
        NodeStatus::Running => ("RUNNING", Style::default().fg(Color::Green)),
        NodeStatus::Error => ("ERROR", Style::default().fg(Color::Red)),
    };

    let title = vec![Line::from(vec![
        Span::styled("CueTimer Node", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  │  "),
        Span::styled(m.display_name.as_str(), Style::default().fg(Color::Yellow)),
        Span::raw(format!(" ({})", m.role)),
        Span::raw("  │  Status: "),
        Span::styled(status_text, status_style),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ])];

    let header = Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Dashboard "));
    f.render_widget(header, area);
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(30),
            Constraint::Percentage(40),
            Constraint::Percentage(30),
        ])
        .split(area);

    // Link
    let peer_id_short = m
        .peer_id
        .as_deref()
        .map(truncate_peer_id)
        .unwrap_or_else(|| "...".to_string());

    let link_info = vec![
        Line::from(vec![
            Span::raw("Peer ID: "),
            Span::styled(peer_id_short, Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("Address: "),
            Span::styled(
                m.address.clone().unwrap_or_else(|| "...".to_string()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("Link: "),
            Span::styled(m.link_status.as_str(), Style::default().fg(Color::Green)),
        ]),
        Line::from(vec![
            Span::raw("Peers: "),
            Span::styled(
                format!("{} (peak {}, total {})", m.peer_list.len(), m.peak_peers, m.total_connections),
                Style::default().fg(Color::White),
            ),
        ]),
    ];
    let link_block = Paragraph::new(link_info).block(Block::default().borders(Borders::ALL).title(" Link "));
    f.render_widget(link_block, chunks[0]);

    // Timer
    let phase_color = match m.timer.phase {
        TimerPhase::Idle => Color::DarkGray,
        TimerPhase::Running => Color::Green,
        TimerPhase::Paused => Color::Yellow,
        TimerPhase::Stopped => Color::Magenta,
    };
    let mut phase_spans = vec![Span::styled(
        format!("{:?}", m.timer.phase).to_uppercase(),
        Style::default().fg(phase_color).add_modifier(Modifier::BOLD),
    )];
    if m.timer.slewing {
        phase_spans.push(Span::styled("  slewing", Style::default().fg(Color::Cyan)));
    }
    if let Some(hold) = m.timer.hold_remaining_ns {
        phase_spans.push(Span::raw(format!("  resumes in {}", format_elapsed(hold))));
    }

    let timer_info = vec![
        Line::from(Span::styled(
            format_elapsed(m.timer.elapsed_ns),
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        )),
        Line::from(phase_spans),
        Line::from(vec![
            Span::raw("Next stop: "),
            Span::styled(
                m.timer.next_event_id.clone().unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::Cyan),
            ),
        ]),
        Line::from(vec![
            Span::raw("Reached: "),
            Span::styled(m.events_reached.to_string(), Style::default().fg(Color::Magenta)),
        ]),
    ];
    let timer_block = Paragraph::new(timer_info).block(Block::default().borders(Borders::ALL).title(" Timer "));
    f.render_widget(timer_block, chunks[1]);

    // Clock sync
    let d = &m.diagnostics;
    let (offset, rtt) = match d.clock_estimate {
        Some(e) => (
            format!("{:+.2} ms", e.offset_ns as f64 / 1e6),
            format!("{:.2} ms ({} samples)", e.round_trip_ns as f64 / 1e6, e.samples),
        ),
        None => ("...".to_string(), "...".to_string()),
    };
    let clock_info = vec![
        Line::from(vec![
            Span::raw("Offset: "),
            Span::styled(offset, Style::default().fg(Color::Yellow)),
        ]),
        Line::from(vec![
            Span::raw("RTT: "),
            Span::styled(rtt, Style::default().fg(Color::Cyan)),
        ]),
        Line::from(vec![
            Span::raw("Frames: "),
            Span::styled(
                format!("{} in / {} out", d.frames_in, d.frames_out),
                Style::default().fg(Color::Green),
            ),
        ]),
        Line::from(vec![
            Span::raw("Dropped: "),
            Span::styled(
                format!(
                    "{} malformed, {} stale, {} pending",
                    d.malformed_frames, d.dropped_stale, d.retransmit_pending
                ),
                Style::default().fg(Color::Red),
            ),
        ]),
    ];
    let clock_block = Paragraph::new(clock_info).block(Block::default().borders(Borders::ALL).title(" Clock "));
    f.render_widget(clock_block, chunks[2]);
}

fn draw_peers(f: &mut Frame, area: Rect, m: &Metrics) {
    let items: Vec<ListItem> = m
        .peer_list
        .iter()
        .map(|p| {
            let (signal, color) = match p.signal {
                SignalQuality::Good => ("good", Color::Green),
                SignalQuality::Degraded => ("degraded", Color::Yellow),
                SignalQuality::Lost => ("lost", Color::Red),
                SignalQuality::Unknown => ("?", Color::DarkGray),
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<16}", p.display_name), Style::default().fg(Color::White)),
                Span::styled(
                    format!("{} ", truncate_peer_id(&p.peer_id)),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("[{}] ", signal), Style::default().fg(color)),
                Span::raw(format!("since {}", p.connected_at.format("%H:%M:%S"))),
            ]))
        })
        .collect();

    let peers = List::new(items).block(Block::default().borders(Borders::ALL).title(" Peers "));
    f.render_widget(peers, area);
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, state: &DashboardState) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total_logs = m.logs.len();

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(state.log_scroll)
        .take(visible_height)
        .map(|entry| {
            let level_style = match entry.level {
                LogLevel::Info => Style::default().fg(Color::Blue),
                LogLevel::Warning => Style::default().fg(Color::Yellow),
                LogLevel::Error => Style::default().fg(Color::Red),
                LogLevel::Connection => Style::default().fg(Color::Green),
                LogLevel::Timer => Style::default().fg(Color::Magenta),
            };

            let time = entry.timestamp.format("%H:%M:%S").to_string();

            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", time), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("[{}] ", entry.level.as_str()), level_style),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let scroll_indicator = if state.auto_scroll {
        " [AUTO] ".to_string()
    } else if total_logs > 0 {
        format!(" [{}/{}] ", total_logs - state.log_scroll, total_logs)
    } else {
        String::new()
    };

    let logs = List::new(log_items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Activity Log{}", scroll_indicator)),
    );
    f.render_widget(logs, area);

    if total_logs > visible_height {
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));

        let mut scrollbar_state =
            ScrollbarState::new(total_logs).position(total_logs.saturating_sub(state.log_scroll + visible_height));

        f.render_stateful_widget(
            scrollbar,
            area.inner(ratatui::layout::Margin {
                vertical: 1,
                horizontal: 0,
            }),
            &mut scrollbar_state,
        );
    }
}

fn draw_footer(f: &mut Frame, area: Rect, state: &DashboardState) {
    let key = Style::default().fg(Color::Black).bg(Color::White);
    let auto_text = if state.auto_scroll { "ON " } else { "OFF" };
    let auto_color = if state.auto_scroll { Color::Green } else { Color::Yellow };

    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" Space ", key),
        Span::raw(" Start/Pause  "),
        Span::styled(" R ", key),
        Span::raw(" Reset  "),
        Span::styled(" S ", key),
        Span::raw(" Hold  "),
        Span::styled(" B ", key),
        Span::raw(" Burst  "),
        Span::styled(" T ", key),
        Span::raw(" Switch role  "),
        Span::styled(" ↑↓ ", key),
        Span::raw(" Scroll: "),
        Span::styled(auto_text, Style::default().fg(auto_color)),
    ]));

    f.render_widget(footer, area);
}

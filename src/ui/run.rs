use crate::config::load_config;
use crate::error::AppError;
use crate::models::{AccountProfile, LimitWindow, Metric, MonitorMode};
use crate::projection::{Projection, ProjectionEngine};
use crate::service::{engine_for, open_store, resolve_mode, MonitorService, PollReport};
use crate::storage::SnapshotStore;
use crate::ui::app::{AppState, ConfirmAction, Screen};
use chrono::{DateTime, Duration, Local, Utc};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use std::time::{Duration as StdDuration, Instant};

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_INFO: Color = Color::Green;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;

const BAR_WIDTH: usize = 30;
const MIN_TICK_SECONDS: u64 = 5;

pub async fn run_tui(mode: MonitorMode) -> Result<(), AppError> {
    let cfg = load_config()?;
    let mode = resolve_mode(mode);
    let service = MonitorService::for_mode(mode, &cfg)?;
    let store = open_store(&cfg, service.source().table())?;
    let engine = engine_for(&cfg)?;
    let tick_rate = StdDuration::from_secs(cfg.poll_seconds(mode).max(MIN_TICK_SECONDS));
    tracing::info!(
        mode = mode.as_label(),
        source = service.source().name(),
        table = store.table().as_label(),
        history = store.is_available(),
        "starting dashboard"
    );

    let mut state = AppState::new(mode);
    state.profile = service.profile().await;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(&mut terminal, state, tick_rate, &store, &engine, &service).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut state: AppState,
    tick_rate: StdDuration,
    store: &SnapshotStore,
    engine: &ProjectionEngine,
    service: &MonitorService,
) -> Result<(), AppError> {
    let metric = service.source().metric();
    let mut last_tick = Instant::now();

    refresh_dashboard(&mut state, store, engine, service).await;

    while state.running {
        terminal.draw(|f| render(f, &state, metric))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0));

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if handle_key(key.code, key.modifiers, &mut state) {
                    refresh_dashboard(&mut state, store, engine, service).await;
                    last_tick = Instant::now();
                }
            }
        }

        if state.screen == Screen::Dashboard && last_tick.elapsed() >= tick_rate {
            refresh_dashboard(&mut state, store, engine, service).await;
            last_tick = Instant::now();
        }
    }

    Ok(())
}

/// Applies a key press to the state; returns true when a refresh was requested.
fn handle_key(code: KeyCode, modifiers: KeyModifiers, state: &mut AppState) -> bool {
    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        state.ask_quit();
        return false;
    }

    match state.screen.clone() {
        Screen::Dashboard => match code {
            KeyCode::Char('q') => state.ask_quit(),
            KeyCode::Char('r') => return true,
            KeyCode::Esc => state.warnings.clear(),
            _ => {}
        },
        Screen::Confirm(action) => match code {
            KeyCode::Esc => state.dismiss(),
            KeyCode::Left => state.confirm_selected = 0,
            KeyCode::Right => state.confirm_selected = 1,
            KeyCode::Enter => {
                if state.confirm_selected == 0 {
                    state.dismiss();
                    return false;
                }
                match action {
                    ConfirmAction::Quit => state.running = false,
                }
            }
            _ => {}
        },
        Screen::ErrorDialog => {
            if matches!(code, KeyCode::Enter | KeyCode::Esc) {
                state.dismiss();
            }
        }
    }
    false
}

async fn refresh_dashboard(
    state: &mut AppState,
    store: &SnapshotStore,
    engine: &ProjectionEngine,
    service: &MonitorService,
) {
    state.status = "refreshing...".into();
    match service.poll(store, engine).await {
        Ok(report) => {
            state.warnings = report.warnings.iter().map(ToString::to_string).collect();
            state.last_refresh = Local::now().format("%H:%M:%S").to_string();
            state.status = "ok".into();
            state.report = Some(report);
        }
        Err(err) => {
            tracing::warn!(error = %err, "refresh failed");
            state.status = format!("refresh failed: {err}");
            if matches!(err, AppError::Credentials(_)) && state.screen == Screen::Dashboard {
                state.show_error(err.to_string());
            }
        }
    }
}

fn render(f: &mut ratatui::Frame, state: &AppState, metric: Metric) {
    let now = Utc::now();
    let report = state.report.as_ref();

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(7),
            Constraint::Length(1),
            Constraint::Length(2),
        ])
        .split(f.area());

    let header = Paragraph::new(header_text(state, report))
        .block(Block::default().borders(Borders::ALL).title(" Session "))
        .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    let (usage_title, usage_lines) = match metric {
        Metric::Utilization => (" Limits ", limit_lines(report, now)),
        Metric::Measure => (" Spend ", spend_lines(report, now)),
    };
    let usage = Paragraph::new(usage_lines)
        .block(Block::default().borders(Borders::ALL).title(usage_title))
        .wrap(Wrap { trim: false });
    f.render_widget(usage, root[1]);

    let projection = report.and_then(|r| r.projection.as_ref());
    let projection_color = match projection.and_then(Projection::ready) {
        Some(p) if !p.is_ready => COLOR_MUTED,
        Some(p) if metric == Metric::Utilization => utilization_color(p.projected_value),
        Some(_) => COLOR_ACCENT,
        None => COLOR_MUTED,
    };
    let projection_lines = if report.is_some() {
        projection_text(projection, metric)
    } else {
        vec!["Waiting for first poll...".to_string()]
    };
    let projection_panel = Paragraph::new(
        projection_lines
            .into_iter()
            .map(Line::from)
            .collect::<Vec<_>>(),
    )
    .block(Block::default().borders(Borders::ALL).title(" Projection "))
    .style(
        Style::default()
            .fg(projection_color)
            .add_modifier(Modifier::BOLD),
    );
    f.render_widget(projection_panel, root[2]);

    let warnings = if state.warnings.is_empty() {
        Paragraph::new(" storage ok").style(Style::default().fg(COLOR_MUTED))
    } else {
        Paragraph::new(format!(" ! {}", state.warnings.join(" | ")))
            .style(Style::default().fg(Color::Yellow))
    };
    f.render_widget(warnings, root[3]);

    let footer = Paragraph::new(footer_text(state))
        .block(Block::default().borders(Borders::TOP))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[4]);

    match &state.screen {
        Screen::Dashboard => {}
        Screen::Confirm(action) => render_confirm(f, state, action),
        Screen::ErrorDialog => render_error(f, state),
    }
}

fn limit_lines(report: Option<&PollReport>, now: DateTime<Utc>) -> Vec<Line<'static>> {
    let Some(report) = report else {
        return vec![Line::from("Waiting for first poll...")];
    };
    if report.observation.limits.is_empty() {
        return vec![Line::from(Span::styled(
            "No limit data reported",
            Style::default().fg(COLOR_MUTED),
        ))];
    }
    report
        .observation
        .limits
        .iter()
        .map(|limit| limit_line(limit, now))
        .collect()
}

fn limit_line(limit: &LimitWindow, now: DateTime<Utc>) -> Line<'static> {
    let color = utilization_color(limit.utilization);
    let countdown = limit
        .resets_at
        .map(|at| format!("resets in {}", format_countdown(at - now)))
        .unwrap_or_else(|| "no reset reported".to_string());
    Line::from(vec![
        Span::styled(
            format!("{:<14}", limit.label),
            Style::default().fg(COLOR_HEADER),
        ),
        Span::styled(usage_bar(limit.utilization, BAR_WIDTH), Style::default().fg(color)),
        Span::styled(
            format!(" {:>5.1}%  ", limit.utilization),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
        Span::styled(countdown, Style::default().fg(COLOR_MUTED)),
    ])
}

fn spend_lines(report: Option<&PollReport>, now: DateTime<Utc>) -> Vec<Line<'static>> {
    let Some(report) = report else {
        return vec![Line::from("Waiting for first poll...")];
    };
    let obs = &report.observation;
    let mut lines = vec![Line::from(vec![
        Span::styled("Month to date  ", Style::default().fg(COLOR_HEADER)),
        Span::styled(
            obs.measure
                .map(|v| format_value(Metric::Measure, v))
                .unwrap_or_else(|| "n/a".to_string()),
            Style::default()
                .fg(COLOR_INFO)
                .add_modifier(Modifier::BOLD),
        ),
    ])];
    if let Some(label) = &obs.period_label {
        lines.push(Line::from(Span::styled(
            format!("Period         {label}"),
            Style::default().fg(COLOR_MUTED),
        )));
    }
    if let Some(boundary) = obs.period_boundary {
        lines.push(Line::from(Span::styled(
            format!("Period ends in {}", format_countdown(boundary - now)),
            Style::default().fg(COLOR_MUTED),
        )));
    }
    lines
}

fn projection_text(projection: Option<&Projection>, metric: Metric) -> Vec<String> {
    match projection {
        None => vec!["No period boundary reported".to_string()],
        Some(Projection::InsufficientData) => vec!["Collecting data...".to_string()],
        Some(Projection::StaleBoundary { boundary }) => vec![
            "Awaiting next period".to_string(),
            format!(
                "Last period ended {}",
                boundary.with_timezone(&Local).format("%b %e %H:%M")
            ),
        ],
        Some(Projection::Ready(p)) => {
            let mut lines = vec![
                format!(
                    "Projected at reset: {}",
                    format_value(metric, p.projected_value)
                ),
                format!(
                    "Rate: {}/h over the last {}",
                    format_value(metric, p.rate_per_hour),
                    format_window(p.window_used)
                ),
                format!(
                    "Reset in {}",
                    format_countdown(Duration::seconds(
                        (p.hours_until_boundary * 3600.0).round() as i64
                    ))
                ),
            ];
            if !p.is_ready {
                lines.insert(0, "Collecting data, projection is provisional".to_string());
            }
            lines
        }
    }
}

fn utilization_color(percent: f64) -> Color {
    if percent < 51.0 {
        Color::Green
    } else if percent < 81.0 {
        Color::Yellow
    } else if percent < 100.0 {
        Color::LightYellow
    } else {
        Color::Red
    }
}

fn usage_bar(percent: f64, width: usize) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn format_value(metric: Metric, value: f64) -> String {
    match metric {
        Metric::Utilization => format!("{value:.1}%"),
        Metric::Measure => format!("${value:.2}"),
    }
}

fn format_window(window: Duration) -> String {
    let minutes = window.num_minutes();
    if minutes >= 1440 && minutes % 1440 == 0 {
        format!("{}d", minutes / 1440)
    } else if minutes >= 60 && minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

fn format_countdown(remaining: Duration) -> String {
    let minutes = remaining.num_minutes();
    if minutes <= 0 {
        return "now".to_string();
    }
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}

fn footer_text(state: &AppState) -> &'static str {
    match state.screen {
        Screen::Dashboard => "r refresh | q quit | Esc clear warnings",
        Screen::Confirm(_) => "Left/Right choose | Enter confirm | Esc cancel",
        Screen::ErrorDialog => "Enter/Esc close",
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn header_text(state: &AppState, report: Option<&PollReport>) -> String {
    let plan = report
        .and_then(|r| r.observation.plan.as_deref())
        .map(|p| format!(" ({p})"))
        .unwrap_or_default();
    let account = state
        .profile
        .as_ref()
        .and_then(AccountProfile::label)
        .map(|label| format!("  ·  {label}"))
        .unwrap_or_default();
    format!(
        " usage-pulse  ·  {}{}{}  ·  {}  ·  updated {} ",
        state.mode.as_label(),
        plan,
        account,
        state.status,
        state.last_refresh
    )
}

fn render_confirm(f: &mut ratatui::Frame, state: &AppState, action: &ConfirmAction) {
    let area = centered_rect(50, 30, f.area());
    f.render_widget(Clear, area);

    let (title, message) = match action {
        ConfirmAction::Quit => ("Confirm Quit", "Stop monitoring and exit usage-pulse?"),
    };

    let cancel_style = if state.confirm_selected == 0 {
        Style::default()
            .fg(Color::Black)
            .bg(Color::Yellow)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let confirm_style = if state.confirm_selected == 1 {
        Style::default()
            .fg(Color::Black)
            .bg(Color::Red)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let content = Paragraph::new(vec![
        Line::from(message),
        Line::from(Span::styled(
            "Snapshot history stays on disk.",
            Style::default().fg(COLOR_MUTED),
        )),
        Line::from(""),
        Line::from(vec![
            Span::styled("[Cancel (Esc)]", cancel_style),
            Span::raw("   "),
            Span::styled("[Quit (Enter)]", confirm_style),
        ]),
    ])
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" {title} ")),
    )
    .alignment(Alignment::Center);

    f.render_widget(content, area);
}

fn render_error(f: &mut ratatui::Frame, state: &AppState) {
    let area = centered_rect(60, 30, f.area());
    f.render_widget(Clear, area);
    let content = Paragraph::new(vec![
        Line::from(state.error_message.clone()),
        Line::from(""),
        Line::from("Press Enter or Esc"),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Error "))
    .style(Style::default().fg(Color::Red))
    .wrap(Wrap { trim: true });
    f.render_widget(content, area);
}

//! TUI rendering using ratatui.

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Frame;

use super::app::{App, View};

pub fn render(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)])
        .split(f.area());

    match &app.current_view {
        View::JobList => render_job_list(f, app, chunks[0]),
        View::JobDetail(job_id) => render_job_detail(f, app, job_id, chunks[0]),
    }

    render_status_bar(f, app, chunks[1]);
}

fn render_job_list(f: &mut Frame, app: &App, area: Rect) {
    let header = Row::new(vec!["Job", "Status", "Feature Branch"])
        .style(Style::default().fg(Color::Yellow))
        .height(1);

    let rows = app.jobs.iter().enumerate().map(|(i, job)| {
        let style = if i == app.selected_job {
            Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        Row::new(vec![
            Cell::from(job.job_id.clone()),
            Cell::from(status_colored(&job.status)),
            Cell::from(job.feature_branch.clone()),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(28),
            Constraint::Length(12),
            Constraint::Percentage(50),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(" Jobs "));

    f.render_widget(table, area);
}

fn render_job_detail(f: &mut Frame, app: &App, job_id: &str, area: Rect) {
    let header = Row::new(vec!["Seq", "Event", "Unit"])
        .style(Style::default().fg(Color::Yellow))
        .height(1);

    let rows = app.events.iter().map(|event| {
        Row::new(vec![
            Cell::from(event.sequence.to_string()),
            Cell::from(event.event_type.clone()),
            Cell::from(event.unit_id.clone().unwrap_or_default()),
        ])
    });

    let table = Table::new(
        rows,
        [Constraint::Length(6), Constraint::Length(28), Constraint::Percentage(40)],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Job {job_id} ")),
    );

    f.render_widget(table, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let text = app.status_message.clone().unwrap_or_else(|| {
        "j/k: move  Enter: open  x: stop  q/Esc: back  Ctrl-C: quit".to_string()
    });
    f.render_widget(Paragraph::new(text), area);
}

fn status_colored(status: &str) -> String {
    status.to_string()
}

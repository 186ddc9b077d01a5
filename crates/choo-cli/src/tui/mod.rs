//! Interactive TUI dashboard for monitoring in-flight and recent jobs.
//!
//! One view per job-status row kind, a 1-second refresh tick. There is no
//! direct database access here -- every refresh is a gRPC call against the
//! running daemon.

pub mod app;
mod ui;

use std::io;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tonic::transport::Channel;

use choo_daemon::proto::choo_daemon_client::ChooDaemonClient;

use app::App;

pub async fn run_dashboard(client: ChooDaemonClient<Channel>) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(client);
    app.refresh().await?;

    let result = run_event_loop(&mut terminal, &mut app).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<()> {
    let tick_rate = app.tick_rate;

    loop {
        terminal.draw(|f| ui::render(f, app))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                app.status_message = None;
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => {
                        app.navigate_back();
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        app.should_quit = true;
                    }
                    KeyCode::Enter => {
                        app.navigate_enter();
                        app.refresh().await?;
                    }
                    KeyCode::Char('j') | KeyCode::Down => app.move_down(),
                    KeyCode::Char('k') | KeyCode::Up => app.move_up(),
                    KeyCode::Char('x') => {
                        if let Err(e) = app.stop_selected(false).await {
                            app.status_message = Some(format!("stop failed: {e}"));
                        }
                    }
                    _ => {}
                }
            }
        } else {
            app.refresh().await?;
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

mod config;
mod console;
mod control;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use shellmux_shell::{
    spawn_session, KeyCode, KeyEvent, SessionError, SessionHandle, SessionId, SessionRegistry,
};

use config::{ConfigError, ShellmuxConfig};
use console::{ConsoleSink, Focus};
use control::{parse_control, Control};

/// How long `/quit` waits for sessions to tear down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("stdin: {0}")]
    Stdin(#[from] std::io::Error),
}

struct OpenSession {
    name: String,
    handle: SessionHandle,
}

struct App {
    registry: Arc<SessionRegistry>,
    focus: Focus,
    sessions: BTreeMap<SessionId, OpenSession>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = match config::config_path(std::env::args().nth(1)) {
        Some(path) => config::load(&path)?,
        None => ShellmuxConfig::single_local(),
    };

    let mut app = App {
        registry: Arc::new(SessionRegistry::new()),
        focus: Focus::default(),
        sessions: BTreeMap::new(),
    };
    for profile in config.sessions {
        let id = app.registry.next_session_id();
        let sink = ConsoleSink::new(id, profile.name.clone(), app.focus.clone(), std::io::stdout());
        let handle = spawn_session(
            id,
            profile.spec.into_transport(),
            Box::new(sink),
            Arc::clone(&app.registry),
        );
        app.sessions.insert(
            id,
            OpenSession {
                name: profile.name,
                handle,
            },
        );
    }
    if let Some(&first) = app.sessions.keys().next() {
        app.focus.set(first);
    }

    for open in app.sessions.values() {
        if let Err(e) = open.handle.connect().await {
            log::warn!("{}: {e}", open.name);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let control = match parse_control(line.trim_end_matches('\r')) {
            Ok(control) => control,
            Err(usage) => {
                eprintln!("{usage}");
                continue;
            }
        };
        if control == Control::Quit {
            break;
        }
        if let Err(e) = app.execute(control).await {
            log::warn!("{e}");
        }
    }

    app.shutdown().await;
    Ok(())
}

impl App {
    fn focused(&self) -> Option<&OpenSession> {
        self.sessions.get(&self.focus.get())
    }

    async fn execute(&mut self, control: Control) -> Result<(), SessionError> {
        match control {
            Control::List => self.list().await,
            Control::Use(id) => self.switch_to(id).await?,
            Control::All(command) => {
                let delivered = self.registry.broadcast(&command).await;
                log::info!("sent to {delivered} sessions");
            }
            Control::Quit => {}
            other => {
                let Some(session) = self.focused() else {
                    eprintln!("no session has focus");
                    return Ok(());
                };
                let handle = &session.handle;
                match other {
                    Control::Connect => handle.connect().await?,
                    Control::Disconnect => handle.disconnect().await?,
                    Control::CtrlC => handle.key(KeyEvent::ctrl_c()).await?,
                    Control::Clear => handle.clear().await?,
                    Control::Type(text) => {
                        handle.text(&text).await?;
                        handle.key(KeyEvent::new(KeyCode::Enter)).await?;
                    }
                    Control::List | Control::Use(_) | Control::All(_) | Control::Quit => {}
                }
            }
        }
        Ok(())
    }

    async fn list(&self) {
        let focused = self.focus.get();
        for (id, open) in &self.sessions {
            let marker = if *id == focused { '*' } else { ' ' };
            match open.handle.snapshot().await {
                Ok(snapshot) => println!(
                    "{marker} {id:>3}  {:<16} {:<12} {}",
                    open.name,
                    format!("{:?}", snapshot.state),
                    snapshot.target
                ),
                Err(_) => println!("{marker} {id:>3}  {:<16} closed", open.name),
            }
        }
    }

    async fn switch_to(&mut self, id: SessionId) -> Result<(), SessionError> {
        let Some(open) = self.sessions.get(&id) else {
            eprintln!("no session {id}");
            return Ok(());
        };
        let snapshot = open.handle.snapshot().await?;
        self.focus.set(id);

        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(console::render_lines(&snapshot.lines).as_bytes());
        let _ = stdout.flush();
        Ok(())
    }

    async fn shutdown(self) {
        for open in self.sessions.values() {
            let _ = open.handle.close().await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.registry.is_empty() {
            log::warn!("{} sessions did not close in time", self.registry.len());
        }
    }
}

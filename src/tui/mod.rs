use anyhow::Result;
use async_trait::async_trait;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chat::Conversations;
use crate::progress::{ProgressNotifier, StatusSink, DEFAULT_MIN_INTERVAL};
use crate::store::timestamp;
use crate::workspace::Workspace;

/// Conversation key of the local terminal surface.
pub const TUI_KEY: &str = "tui";

const HELP: &str = "Commands:
/new - Start a fresh conversation
/stop - Stop the running request
/jobs - List cron jobs
/tasks - List open tasks
/help - This message
/quit - Exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speaker {
    User,
    Agent,
    Status,
}

/// Results from the background agent task.
#[derive(Debug)]
enum UiEvent {
    Progress(String),
    Reply(String),
    Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Forwards progress labels into the UI loop.
struct ChannelStatus {
    tx: mpsc::UnboundedSender<UiEvent>,
}

#[async_trait]
impl StatusSink for ChannelStatus {
    async fn edit(&self, text: &str) -> Result<()> {
        self.tx.send(UiEvent::Progress(text.to_string()))?;
        Ok(())
    }
}

pub struct TuiApp {
    conversations: Conversations,
    workspace: Workspace,
    messages: Vec<(Speaker, String)>,
    input: String,
    busy: bool,
    progress: Option<String>,
    tx: mpsc::UnboundedSender<UiEvent>,
    rx: mpsc::UnboundedReceiver<UiEvent>,
}

impl TuiApp {
    pub fn new(conversations: Conversations, workspace: Workspace) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            conversations,
            workspace,
            messages: Vec::new(),
            input: String::new(),
            busy: false,
            progress: None,
            tx,
            rx,
        }
    }

    fn add_status(&mut self, text: impl Into<String>) {
        self.messages.push((Speaker::Status, text.into()));
    }

    fn apply(&mut self, event: UiEvent) {
        match event {
            UiEvent::Progress(label) => {
                if self.busy {
                    self.progress = Some(label);
                }
            }
            UiEvent::Reply(answer) => {
                self.busy = false;
                self.progress = None;
                self.messages.push((Speaker::Agent, answer));
            }
            UiEvent::Failed(error) => {
                self.busy = false;
                self.progress = None;
                self.add_status(format!("Error: {}", error));
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.apply(event);
        }
    }

    fn submit(&mut self, prompt: String) {
        if self.busy {
            self.add_status("A request is already running. Use /stop to cancel it.");
            return;
        }
        self.messages.push((Speaker::User, prompt.clone()));
        self.busy = true;

        let conversations = self.conversations.clone();
        let tx = self.tx.clone();
        let notifier = ProgressNotifier::spawn(
            Arc::new(ChannelStatus { tx: tx.clone() }),
            DEFAULT_MIN_INTERVAL,
        );
        tokio::spawn(async move {
            let event = match conversations.submit(TUI_KEY, &prompt, Some(notifier)).await {
                Ok(reply) => UiEvent::Reply(reply.answer),
                Err(e) => UiEvent::Failed(format!("{:#}", e)),
            };
            // The UI may already be gone.
            let _ = tx.send(event);
        });
    }

    fn list_jobs(&mut self) {
        let jobs = self.workspace.cron_jobs().list();
        if jobs.is_empty() {
            self.add_status("No cron jobs");
            return;
        }
        for job in jobs {
            let state = if job.enabled { "" } else { " [disabled]" };
            self.add_status(format!("{}  {}  {}{}", job.id, job.schedule, job.prompt, state));
        }
    }

    fn list_tasks(&mut self) {
        let open: Vec<_> = self
            .workspace
            .tasks()
            .list(None)
            .into_iter()
            .filter(|t| !t.status.is_completed())
            .collect();
        if open.is_empty() {
            self.add_status("No open tasks");
            return;
        }
        for task in open {
            let line = match task.due {
                Some(due) => format!("{} (due {})", task.display_title(), timestamp::format(&due)),
                None => task.display_title().to_string(),
            };
            self.add_status(line);
        }
    }

    async fn handle_input(&mut self, input: &str) -> Flow {
        let input = input.trim();
        if input.is_empty() {
            return Flow::Continue;
        }
        let cmd = input
            .split_whitespace()
            .next()
            .map(str::to_lowercase)
            .unwrap_or_default();

        match cmd.as_str() {
            "/quit" | "/exit" => return Flow::Quit,
            "/new" => {
                self.conversations.stop(TUI_KEY);
                match self.conversations.reset(TUI_KEY).await {
                    Ok(()) => {
                        self.messages.clear();
                        self.add_status("Started a new conversation");
                    }
                    Err(e) => self.add_status(format!("Error: {:#}", e)),
                }
            }
            "/stop" => {
                if self.conversations.stop(TUI_KEY) {
                    self.add_status("Stopping the current request");
                } else {
                    self.add_status("Nothing is running");
                }
            }
            "/jobs" => self.list_jobs(),
            "/tasks" => self.list_tasks(),
            "/help" => {
                for line in HELP.lines() {
                    self.add_status(line);
                }
            }
            _ => self.submit(input.to_string()),
        }
        Flow::Continue
    }
}

/// Runs the terminal chat until the user quits or `shutdown` fires.
pub async fn run_tui(
    conversations: Conversations,
    workspace: Workspace,
    shutdown: CancellationToken,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = TuiApp::new(conversations, workspace);
    app.add_status("Welcome to aide");
    app.add_status("Type /help for commands");
    info!("TUI started");

    let result = event_loop(&mut terminal, &mut app, &shutdown).await;

    app.conversations.stop(TUI_KEY);
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    info!("TUI stopped");

    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut TuiApp,
    shutdown: &CancellationToken,
) -> Result<()> {
    while !shutdown.is_cancelled() {
        app.drain_events();
        terminal.draw(|f| ui(f, app))?;

        let polled = tokio::task::block_in_place(|| event::poll(Duration::from_millis(100)))?;
        if !polled {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
            KeyCode::Esc => break,
            KeyCode::Enter => {
                let input = std::mem::take(&mut app.input);
                if app.handle_input(&input).await == Flow::Quit {
                    break;
                }
            }
            KeyCode::Char(c) => app.input.push(c),
            KeyCode::Backspace => {
                app.input.pop();
            }
            _ => {}
        }
    }
    if shutdown.is_cancelled() {
        warn!("TUI closed by shutdown");
    }
    Ok(())
}

fn ui(f: &mut Frame, app: &TuiApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(1),
            Constraint::Length(3),
            Constraint::Length(1),
        ])
        .split(f.area());

    let title = Paragraph::new("aide")
        .style(Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(title, chunks[0]);

    let messages: Vec<ListItem> = app
        .messages
        .iter()
        .flat_map(|(speaker, text)| {
            let (prefix, style) = match speaker {
                Speaker::User => ("You: ", Style::default().fg(Color::Cyan)),
                Speaker::Agent => ("Agent: ", Style::default().fg(Color::White)),
                Speaker::Status => ("", Style::default().fg(Color::DarkGray)),
            };
            text.lines()
                .enumerate()
                .map(move |(i, line)| {
                    let lead = if i == 0 { prefix } else { "" };
                    ListItem::new(Line::from(Span::styled(format!("{}{}", lead, line), style)))
                })
                .collect::<Vec<_>>()
        })
        .collect();

    // Keep the newest lines in view.
    let visible = chunks[1].height.saturating_sub(2) as usize;
    let skip = messages.len().saturating_sub(visible);
    let messages = List::new(messages.into_iter().skip(skip).collect::<Vec<_>>())
        .block(Block::default().borders(Borders::ALL).title("Chat"));
    f.render_widget(messages, chunks[1]);

    let (input_style, input_title) = if app.busy {
        (
            Style::default().fg(Color::Yellow),
            app.progress.as_deref().unwrap_or("Thinking..."),
        )
    } else {
        (Style::default().fg(Color::White), "Input")
    };
    let input = Paragraph::new(app.input.as_str())
        .style(input_style)
        .block(Block::default().borders(Borders::ALL).title(input_title));
    f.render_widget(input, chunks[2]);

    let help = Paragraph::new("Enter: Send | Esc/Ctrl+C: Quit | /help for commands")
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(help, chunks[3]);
}

use crate::agent::ChatAgent;
use crate::geo::MapView;
use crate::relay::{ DisplaySink, SinkError };
use crate::session::Session;

use async_trait::async_trait;
use log::error;
use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{ AsyncBufRead, AsyncBufReadExt, BufReader };

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Chat(String),
    Clear,
    Map,
    Quit,
    Empty,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => ConsoleCommand::Empty,
            "/quit" | "/exit" => ConsoleCommand::Quit,
            "/clear" => ConsoleCommand::Clear,
            "/map" => ConsoleCommand::Map,
            text => ConsoleCommand::Chat(text.to_string()),
        }
    }
}

fn io_err(e: std::io::Error) -> SinkError {
    SinkError(e.to_string())
}

fn describe_map(view: &MapView) -> String {
    format!(
        "[map] {} ({:.6}, {:.6}) {}",
        view.marker.popup,
        view.center.latitude,
        view.center.longitude,
        view.osm_url()
    )
}

/// Streams a turn to a terminal, printing only what is new since the last update.
pub struct ConsoleSink<W> {
    out: W,
    shown: String,
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, shown: String::new() }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn show(&mut self, text: &str) -> std::io::Result<()> {
        match text.strip_prefix(self.shown.as_str()) {
            Some(suffix) => write!(self.out, "{}", suffix)?,
            // A new model round started over; put it on its own line.
            None => write!(self.out, "\n{}", text)?,
        }
        self.shown = text.to_string();
        self.out.flush()
    }
}

#[async_trait]
impl<W: Write + Send> DisplaySink for ConsoleSink<W> {
    async fn partial(&mut self, text: &str) -> Result<(), SinkError> {
        self.show(text).map_err(io_err)
    }

    async fn notice(&mut self, message: &str) -> Result<(), SinkError> {
        writeln!(self.out, "\n[notice] {}", message).map_err(io_err)?;
        self.shown.clear();
        Ok(())
    }

    async fn map(&mut self, view: &MapView) -> Result<(), SinkError> {
        writeln!(self.out, "\n{}", describe_map(view)).map_err(io_err)?;
        self.shown.clear();
        Ok(())
    }

    async fn finish(&mut self, text: &str) -> Result<(), SinkError> {
        self.show(text).map_err(io_err)?;
        writeln!(self.out).map_err(io_err)?;
        self.shown.clear();
        Ok(())
    }
}

fn print_history<W: Write>(out: &mut W, session: &Session) -> std::io::Result<()> {
    for entry in session.transcript() {
        writeln!(out, "{}: {}", entry.speaker, entry.content)?;
    }
    Ok(())
}

/// Reads commands from `input` until EOF or `/quit`.
pub async fn run_console_with<R, W>(
    agent: Arc<ChatAgent>,
    input: R,
    out: W
) -> Result<(), Box<dyn Error + Send + Sync>>
    where R: AsyncBufRead + Unpin, W: Write + Send
{
    let mut session = agent.new_session().await?;
    let mut sink = ConsoleSink::new(out);
    print_history(&mut sink.out, &session)?;

    let mut lines = input.lines();
    loop {
        write!(sink.out, "> ")?;
        sink.out.flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Quit => {
                break;
            }
            ConsoleCommand::Clear => {
                session.clear();
                writeln!(sink.out, "(conversation cleared)")?;
            }
            ConsoleCommand::Map =>
                match session.map() {
                    Some(view) => writeln!(sink.out, "{}", describe_map(view))?,
                    None => writeln!(sink.out, "(no map yet)")?,
                }
            ConsoleCommand::Chat(prompt) => {
                write!(sink.out, "assistant: ")?;
                if let Err(e) = agent.process_message(&mut session, &prompt, &mut sink).await {
                    error!("Agent processing error: {}", e);
                    writeln!(sink.out, "\n[error] {}", e)?;
                }
            }
        }
    }
    Ok(())
}

pub async fn run_console(agent: Arc<ChatAgent>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let stdin = BufReader::new(tokio::io::stdin());
    run_console_with(agent, stdin, std::io::stdout()).await
}

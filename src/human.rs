//! Human-facing boundary of the front-line agent

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};

/// Blocking question/answer exchange with a person
#[async_trait]
pub trait HumanInterface: Send {
    /// Ask `question` and wait for one answer; `None` when input has ended
    async fn ask(&mut self, question: &str) -> io::Result<Option<String>>;

    /// Show information without expecting an answer
    async fn tell(&mut self, message: &str) -> io::Result<()>;
}

/// Terminal human: questions on stdout, answers from stdin lines
pub struct StdinHuman {
    lines: Lines<BufReader<Stdin>>,
    stdout: Stdout,
}

impl StdinHuman {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdinHuman {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HumanInterface for StdinHuman {
    async fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
        self.stdout
            .write_all(format!("{question}\nYour response: ").as_bytes())
            .await?;
        self.stdout.flush().await?;
        self.lines.next_line().await
    }

    async fn tell(&mut self, message: &str) -> io::Result<()> {
        self.stdout.write_all(format!("{message}\n").as_bytes()).await?;
        self.stdout.flush().await
    }
}

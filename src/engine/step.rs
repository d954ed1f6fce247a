//! Single-step debugging prompt

use crate::Result;
use std::io::{self, BufRead, Write};

/// Blocks before each read until the operator asks for the next packet.
pub trait StepPrompt: Send {
    fn wait(&mut self) -> Result<()>;
}

impl<F> StepPrompt for F
where
    F: FnMut() -> Result<()> + Send,
{
    fn wait(&mut self) -> Result<()> {
        self()
    }
}

/// Waits for a newline on stdin.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl StepPrompt for StdinPrompt {
    fn wait(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "Press enter to read next packet")?;
        stdout.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(())
    }
}

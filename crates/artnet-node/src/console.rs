//! Line console standing in for the hardware buttons and knob.
//!
//! One command per line:
//!
//! - `next` / `n`: press the advance button
//! - `status` / `s`: press the status button
//! - `knob <raw>` / `k <raw>`: set the raw knob reading (0..=4095)
//!
//! Commands for inputs the board does not have are refused.

use artnet_core::Event;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::error::Result;

/// Highest value the knob's ADC produces.
pub const KNOB_MAX: u16 = 4095;

/// Which local inputs this node has wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inputs {
    pub buttons: bool,
    pub knob: bool,
}

impl Inputs {
    /// Every input wired.
    pub const ALL: Self = Self {
        buttons: true,
        knob: true,
    };

    /// Whether `event` comes from an input that is wired.
    pub fn accepts(&self, event: &Event) -> bool {
        match event {
            Event::AdvancePressed | Event::StatusRequested => self.buttons,
            Event::ChaosInput(_) => self.knob,
            _ => false,
        }
    }
}

/// Parse one console line. Blank or unrecognized lines yield `None`.
pub fn parse_command(line: &str) -> Option<Event> {
    let mut words = line.split_whitespace();
    let command = words.next()?.to_ascii_lowercase();

    match command.as_str() {
        "next" | "n" => Some(Event::AdvancePressed),
        "status" | "s" => Some(Event::StatusRequested),
        "knob" | "k" => {
            let raw: u16 = words.next()?.parse().ok()?;
            Some(Event::ChaosInput(raw.min(KNOB_MAX)))
        }
        _ => None,
    }
}

/// Forward commands read from `input` until it ends or the node stops
/// listening.
pub async fn run<I>(input: I, inputs: Inputs, events: mpsc::UnboundedSender<Event>) -> Result<()>
where
    I: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Some(event) if !inputs.accepts(&event) => {
                tracing::warn!("This board has no input for: {}", line.trim());
            }
            Some(event) => {
                tracing::debug!(?event, "Console command");
                if events.send(event).is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => tracing::warn!("Unknown command: {} (try next, status, knob <0-4095>)", line.trim()),
        }
    }

    Ok(())
}

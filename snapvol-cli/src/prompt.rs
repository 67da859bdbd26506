// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, BufRead, Write};
use std::thread;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::warn;

use snapvol_fetch::InUseGate;
use snapvol_types::Volume;

/// Asks on the terminal before snapshotting a volume attached to an instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptInUse;

#[async_trait]
impl InUseGate for PromptInUse {
    async fn confirm(&self, volume: &Volume) -> bool {
        let instance = volume.attached_instance.as_deref().unwrap_or("an instance");
        let question = format!(
            "Volume {} is in use by {instance}; the snapshot may not be consistent. Continue?",
            volume.display_name()
        );
        off_runtime(move || confirm(&question)).await
    }
}

/// Runs a blocking question on a detached thread; one left waiting in
/// `read_line` does not hold up runtime shutdown.
async fn off_runtime<F>(ask: F) -> bool
where
    F: FnOnce() -> bool + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let spawned = thread::Builder::new()
        .name("snapvol-prompt".to_string())
        .spawn(move || {
            let _ = tx.send(ask());
        });
    if let Err(e) = spawned {
        warn!(error = %e, "could not start prompt thread");
        return false;
    }
    rx.await.unwrap_or(false)
}

/// Yes/no question on stderr; anything but `y`/`yes` (including EOF) is a no.
pub fn confirm(question: &str) -> bool {
    let stdin = io::stdin();
    ask(question, &mut stdin.lock(), &mut io::stderr())
}

fn ask(question: &str, input: &mut impl BufRead, output: &mut impl Write) -> bool {
    if write!(output, "{question} [y/N] ").and_then(|_| output.flush()).is_err() {
        return false;
    }
    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => parse_answer(&answer),
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("\n"));
        assert!(!parse_answer("no"));
        assert!(!parse_answer("yep"));
    }

    #[test]
    fn end_of_input_declines() {
        let mut output = Vec::new();
        assert!(!ask("Overwrite?", &mut io::empty(), &mut output));
        assert_eq!(String::from_utf8(output).unwrap(), "Overwrite? [y/N] ");
    }

    #[tokio::test]
    async fn answers_come_back_from_the_prompt_thread() {
        assert!(off_runtime(|| true).await);
        assert!(!off_runtime(|| false).await);
    }

    #[tokio::test]
    async fn panicking_prompt_declines() {
        assert!(!off_runtime(|| panic!("terminal went away")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_prompt_yields_to_cancellation() {
        let cancel = tokio_util::sync::CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            trigger.cancel();
        });
        // nobody ever types an answer
        let (_keyboard, stdin) = std::sync::mpsc::channel::<()>();
        let answered = tokio::select! {
            _ = cancel.cancelled() => None,
            answer = off_runtime(move || stdin.recv().is_ok()) => Some(answer),
        };
        assert_eq!(answered, None);
    }

    #[test]
    fn reads_a_single_line() {
        let mut input = io::Cursor::new("y\nn\n");
        assert!(ask("Continue?", &mut input, &mut io::sink()));
    }
}

//! Interactive y/N confirmation before running a risky command.

use anyhow::Result;
use std::io::{self, BufRead, Write};
use tracing::info;

/// Asks a yes/no question. Anything but `y`/`yes` is a no, including EOF.
///
/// # Example
///
/// ```no_run
/// use dictum::confirm::Confirmer;
///
/// let confirmer = Confirmer::new();
/// if confirmer.confirm("rm -rf build")? {
///     // run it
/// }
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct Confirmer;

impl Confirmer {
    pub fn new() -> Self {
        Self
    }

    /// Prompts on the provided streams (for testing).
    pub fn confirm_with_io<R: BufRead, W: Write>(
        &self,
        command: &str,
        input: &mut R,
        output: &mut W,
    ) -> Result<bool> {
        writeln!(output, "\n  {}\n", command)?;
        write!(output, "Run this command? [y/N] ")?;
        output.flush()?;

        let mut line = String::new();
        input.read_line(&mut line)?;
        let accepted = matches!(line.trim().to_lowercase().as_str(), "y" | "yes");

        info!("User {} command", if accepted { "confirmed" } else { "declined" });
        Ok(accepted)
    }

    /// Prompts on stderr and reads stdin, so stdout stays clean for the command.
    pub fn confirm(&self, command: &str) -> Result<bool> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stderr();
        self.confirm_with_io(command, &mut input, &mut output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn answer(reply: &str) -> (bool, String) {
        let mut input = Cursor::new(reply.as_bytes().to_vec());
        let mut output = Vec::new();
        let accepted = Confirmer::new()
            .confirm_with_io("rm -rf build", &mut input, &mut output)
            .unwrap();
        (accepted, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_yes_answers_accept() {
        for reply in ["y\n", "Y\n", "yes\n", "  YES  \n"] {
            assert!(answer(reply).0, "{:?}", reply);
        }
    }

    #[test]
    fn test_default_is_no() {
        for reply in ["\n", "n\n", "no\n", "sure\n", ""] {
            assert!(!answer(reply).0, "{:?}", reply);
        }
    }

    #[test]
    fn test_prompt_shows_command() {
        let (_, shown) = answer("n\n");
        assert!(shown.contains("rm -rf build"));
        assert!(shown.contains("[y/N]"));
    }
}

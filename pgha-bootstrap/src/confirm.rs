use colored::*;
use std::io::{BufRead, Result, Write};

const MASK: &str = "********";

/// The values a run is about to use, shown before anything is changed.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    title: String,
    rows: Vec<(String, String)>,
    show_secrets: bool,
}

impl Summary {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn show_secrets(mut self, show: bool) -> Self {
        self.show_secrets = show;
        self
    }

    pub fn row(mut self, key: &str, value: impl ToString) -> Self {
        self.rows.push((key.to_string(), value.to_string()));
        self
    }

    pub fn secret(self, key: &str, value: &str, generated: bool) -> Self {
        let shown = if self.show_secrets {
            value.to_string()
        } else {
            MASK.to_string()
        };
        let shown = if generated {
            format!("{shown} (generated)")
        } else {
            shown
        };
        self.row(key, shown)
    }

    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        let width = self.rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        writeln!(out)?;
        writeln!(out, "{}", format!("=== {} ===", self.title).bold())?;
        for (key, value) in &self.rows {
            writeln!(out, "  {:<width$}  {}", key, value.cyan())?;
        }
        writeln!(out)?;
        Ok(())
    }
}

fn read_answer(input: &mut dyn BufRead) -> Result<String> {
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim_end_matches(['\n', '\r']).to_string())
}

/// Prints the summary and blocks until the operator answers. Only the exact
/// answer `yes` proceeds; end of input counts as a refusal.
pub fn confirm(summary: &Summary, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<bool> {
    summary.write_to(out)?;
    write!(out, "{} ", "Proceed with these settings? (yes/no):".yellow().bold())?;
    out.flush()?;
    Ok(read_answer(input)? == "yes")
}

/// Free-form yes/no question, `y` or `yes` in any case means yes.
pub fn ask_yes_no(question: &str, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<bool> {
    write!(out, "{} ", format!("{question} (y/n):").yellow())?;
    out.flush()?;
    let answer = read_answer(input)?.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn summary() -> Summary {
        Summary::new("etcd configuration")
            .row("Node name", "pg-node1")
            .secret("Superuser password", "hunter2hunter2", true)
    }

    fn answer(text: &str) -> bool {
        let mut input = Cursor::new(text.as_bytes().to_vec());
        let mut out = Vec::<u8>::new();
        confirm(&summary(), &mut input, &mut out).unwrap()
    }

    #[test]
    fn test_only_exact_yes_confirms() {
        assert!(answer("yes\n"));
        assert!(answer("yes\r\n"));
        assert!(answer("yes"));
        for refusal in ["no\n", "y\n", "YES\n", "Yes\n", " yes\n", "yes please\n", "\n", ""] {
            assert!(!answer(refusal), "{refusal:?} must not confirm");
        }
    }

    #[test]
    fn test_summary_masks_secrets() {
        let mut out = Vec::<u8>::new();
        summary().write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("=== etcd configuration ==="));
        assert!(text.contains("pg-node1"));
        assert!(text.contains("******** (generated)"));
        assert!(!text.contains("hunter2"));

        let mut out = Vec::<u8>::new();
        Summary::new("x")
            .show_secrets(true)
            .secret("pw", "hunter2hunter2", false)
            .write_to(&mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("hunter2hunter2"));
        assert!(!text.contains("generated"));
    }

    #[test]
    fn test_ask_yes_no() {
        let ask = |text: &str| {
            let mut input = Cursor::new(text.as_bytes().to_vec());
            ask_yes_no("Recreate?", &mut input, &mut Vec::<u8>::new()).unwrap()
        };
        assert!(ask("y\n"));
        assert!(ask("YES\n"));
        assert!(!ask("n\n"));
        assert!(!ask(""));
    }
}

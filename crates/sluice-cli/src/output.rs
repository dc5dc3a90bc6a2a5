//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::Value;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output, one document per line
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a query result or call response
    pub fn print_value(&self, value: &Value) {
        match self.format {
            OutputFormat::Human => println!("{}", pretty(value)),
            OutputFormat::Json | OutputFormat::Quiet => println!("{}", value),
        }
    }

    /// Print one update of an observed query
    pub fn print_update(&self, value: &Value, checksum: u64) {
        match self.format {
            OutputFormat::Human => {
                println!("── checksum {} ──", checksum);
                println!("{}", pretty(value));
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({ "checksum": checksum, "value": value })
                );
            }
            OutputFormat::Quiet => println!("{}", value),
        }
    }

    /// Print a list of key/value rows
    pub fn print_fields(&self, fields: &[(&str, String)]) {
        match self.format {
            OutputFormat::Human => {
                let width = fields.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
                for (key, value) in fields {
                    println!("  {:<width$}  {}", format!("{}:", key), value, width = width + 1);
                }
            }
            OutputFormat::Json => {
                let object: serde_json::Map<String, Value> = fields
                    .iter()
                    .map(|(key, value)| (key.to_string(), Value::String(value.clone())))
                    .collect();
                println!("{}", Value::Object(object));
            }
            OutputFormat::Quiet => {
                for (_, value) in fields {
                    println!("{}", value);
                }
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_pretty() {
        assert_eq!(pretty(&json!(3)), "3");
        assert_eq!(pretty(&json!({ "a": 1 })), "{\n  \"a\": 1\n}");
    }
}

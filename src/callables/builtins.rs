//! Built-in callables shipped with the agent

use std::io::Write;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde_json::Value;

use super::CallableRegistry;

/// Register every built-in callable
pub fn register_builtins(registry: &mut CallableRegistry) {
    let builtins: [(&str, fn(&[Value], &mut dyn Write) -> anyhow::Result<()>); 5] = [
        ("math.add", add),
        ("util.echo", echo),
        ("util.sleep", sleep),
        ("util.fail", fail),
        ("util.env", env),
    ];

    for (path, callable) in builtins {
        if let Err(e) = registry.register(path, callable) {
            tracing::error!(method_path = path, error = %e, "Failed to register built-in callable");
        }
    }
}

/// Sum numeric arguments and print the result
fn add(args: &[Value], out: &mut dyn Write) -> anyhow::Result<()> {
    if args.iter().all(|v| v.is_i64()) {
        let sum = args
            .iter()
            .filter_map(Value::as_i64)
            .try_fold(0i64, |acc, n| acc.checked_add(n))
            .ok_or_else(|| anyhow!("integer overflow"))?;
        writeln!(out, "{}", sum)?;
        return Ok(());
    }

    let mut sum = 0.0;
    for (i, arg) in args.iter().enumerate() {
        sum += arg
            .as_f64()
            .with_context(|| format!("argument {} is not a number: {}", i, arg))?;
    }
    writeln!(out, "{}", sum)?;
    Ok(())
}

/// Print every argument on its own line
fn echo(args: &[Value], out: &mut dyn Write) -> anyhow::Result<()> {
    for arg in args {
        match arg {
            Value::String(s) => writeln!(out, "{}", s)?,
            other => writeln!(out, "{}", other)?,
        }
    }
    Ok(())
}

/// Sleep for the given number of seconds (fractions allowed)
fn sleep(args: &[Value], out: &mut dyn Write) -> anyhow::Result<()> {
    let secs = match args.first() {
        Some(v) => v
            .as_f64()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .with_context(|| format!("sleep duration must be a non-negative number, got {}", v))?,
        None => bail!("util.sleep expects one argument"),
    };
    writeln!(out, "sleeping {}s", secs)?;
    out.flush()?;
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(())
}

/// Print the arguments and fail
fn fail(args: &[Value], out: &mut dyn Write) -> anyhow::Result<()> {
    let message = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "task failed".to_string(),
    };
    writeln!(out, "failing: {}", message)?;
    Err(anyhow!(message))
}

/// Print the values of the named environment variables
fn env(args: &[Value], out: &mut dyn Write) -> anyhow::Result<()> {
    for arg in args {
        let name = arg
            .as_str()
            .with_context(|| format!("environment variable name must be a string, got {}", arg))?;
        match std::env::var(name) {
            Ok(value) => writeln!(out, "{}={}", name, value)?,
            Err(_) => writeln!(out, "{} is not set", name)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(f: fn(&[Value], &mut dyn Write) -> anyhow::Result<()>, args: &[Value]) -> (anyhow::Result<()>, String) {
        let mut out = Vec::new();
        let result = f(args, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_add_integers_and_floats() {
        let (result, out) = run(add, &[json!(2), json!(3)]);
        assert!(result.is_ok());
        assert_eq!(out, "5\n");

        let (result, out) = run(add, &[json!(1.5), json!(2)]);
        assert!(result.is_ok());
        assert_eq!(out, "3.5\n");
    }

    #[test]
    fn test_add_rejects_non_numbers() {
        let (result, _) = run(add, &[json!(1), json!("two")]);
        assert!(result.unwrap_err().to_string().contains("argument 1"));
    }

    #[test]
    fn test_echo() {
        let (result, out) = run(echo, &[json!("hello"), json!({"k": 1})]);
        assert!(result.is_ok());
        assert_eq!(out, "hello\n{\"k\":1}\n");
    }

    #[test]
    fn test_sleep_validates_argument() {
        let (result, _) = run(sleep, &[json!(-1)]);
        assert!(result.is_err());
        let (result, _) = run(sleep, &[]);
        assert!(result.is_err());
        let (result, out) = run(sleep, &[json!(0)]);
        assert!(result.is_ok());
        assert!(out.contains("sleeping"));
    }

    #[test]
    fn test_fail_writes_then_errors() {
        let (result, out) = run(fail, &[json!("boom")]);
        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(out, "failing: boom\n");
    }
}

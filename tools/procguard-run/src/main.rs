use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use procguard::process::{find_program_by_name, wait};
use procguard::{ExecOptions, ProcessError, Redirect, RemoveFileOnSignal, StdStream};
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "procguard-run")]
#[command(about = "Run a program with redirects, limits and cleanup on interruption")]
struct Cli {
    /// Seconds to wait before terminating the child (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout: u32,

    /// Address-space ceiling for the child in MiB (0 is unlimited)
    #[arg(long, value_name = "MB", default_value_t = 0)]
    memory_limit: u64,

    /// Read the child's stdin from PATH (`null` for the null device)
    #[arg(long, value_name = "PATH")]
    stdin: Option<String>,

    /// Write the child's stdout to PATH (`null` for the null device)
    #[arg(long, value_name = "PATH")]
    stdout: Option<String>,

    /// Write the child's stderr to PATH (`null` for the null device)
    #[arg(long, value_name = "PATH")]
    stderr: Option<String>,

    /// Exact child environment entry; repeat for more
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Delete PATH if this process is interrupted, crashes or the child fails
    #[arg(long, value_name = "PATH")]
    remove_on_signal: Vec<PathBuf>,

    /// Print a stack trace if this process faults
    #[arg(long)]
    print_stack_trace: bool,

    /// Only report whether the command line fits the system limits
    #[arg(long)]
    check_limits: bool,

    /// Fault deliberately after setup (debug builds only)
    #[arg(long, hide = true)]
    crash: bool,

    /// More log output; repeat for debug
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Program to run, looked up on PATH unless it contains a separator
    #[arg(required_unless_present = "crash")]
    program: Option<String>,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", raw)),
    }
}

fn redirect_from(arg: Option<&str>) -> Redirect {
    match arg {
        None => Redirect::Inherit,
        Some("null") => Redirect::Null,
        Some(path) => Redirect::file(path),
    }
}

fn exec_options(cli: &Cli) -> ExecOptions {
    let mut options = ExecOptions::new()
        .with_redirect(StdStream::Stdin, redirect_from(cli.stdin.as_deref()))
        .with_redirect(StdStream::Stdout, redirect_from(cli.stdout.as_deref()))
        .with_redirect(StdStream::Stderr, redirect_from(cli.stderr.as_deref()))
        .with_memory_limit_mb(cli.memory_limit);
    if !cli.env.is_empty() {
        options = options.with_env(cli.env.iter().cloned());
    }
    options
}

/// Negative statuses (crash, timeout, fault codes) do not fit an exit code.
fn exit_code_for(status: i32) -> i32 {
    if status < 0 {
        1
    } else {
        status
    }
}

fn announce_ready() -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "ready")?;
    stdout.flush().context("failed to flush stdout")?;
    Ok(())
}

#[cfg(debug_assertions)]
fn crash() -> Result<()> {
    announce_ready()?;
    let page = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            4096,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if page != libc::MAP_FAILED {
        unsafe { std::ptr::write_volatile(page.cast::<u8>(), 1) };
    }
    std::process::abort()
}

#[cfg(not(debug_assertions))]
fn crash() -> Result<()> {
    bail!("--crash is only available in debug builds")
}

fn run(cli: Cli) -> Result<i32> {
    if cli.print_stack_trace {
        procguard::print_stack_trace_on_fault();
    }
    let guards: Vec<RemoveFileOnSignal<'static>> = cli
        .remove_on_signal
        .iter()
        .map(|path| RemoveFileOnSignal::new(path))
        .collect();

    if cli.crash {
        crash()?;
    }

    let name = cli
        .program
        .clone()
        .ok_or_else(|| anyhow!("no program given"))?;
    let mut argv = vec![OsString::from(&name)];
    argv.extend(cli.args.iter().cloned());

    if cli.check_limits {
        let raw: Vec<&[u8]> = argv.iter().map(|a| a.as_bytes()).collect();
        let fits = procguard::arguments_fit_within_system_limits(&raw);
        println!("{}", if fits { "fits" } else { "too long" });
        for guard in guards {
            guard.keep();
        }
        return Ok(if fits { 0 } else { 1 });
    }

    let program = match find_program_by_name(&name) {
        Some(path) => path,
        None => bail!("program not found on PATH: {}", name),
    };
    let handle = procguard::execute(&program, &argv, &exec_options(&cli))
        .with_context(|| format!("failed to launch {}", program.display()))?;
    announce_ready()?;

    let status = match wait(handle, cli.timeout) {
        Ok(status) => status,
        Err(err @ (ProcessError::TimedOut { .. } | ProcessError::Crashed { .. })) => {
            log::warn!("{}", err);
            err.exit_status()
        }
        Err(err) => return Err(err).context("failed waiting for child"),
    };

    if status == 0 {
        for guard in guards {
            guard.keep();
        }
    } else {
        log::info!("child failed with status {}; cleaning up", status);
        procguard::run_cleanup_handlers();
    }
    Ok(exit_code_for(status))
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("procguard-run: {:#}", err);
            procguard::run_cleanup_handlers();
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn env_pairs_need_a_key() {
        assert_eq!(
            parse_env_pair("CC=clang -O2").unwrap(),
            ("CC".to_string(), "clang -O2".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
        assert!(parse_env_pair("=value").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn null_keyword_selects_null_device() {
        assert_eq!(redirect_from(None), Redirect::Inherit);
        assert_eq!(redirect_from(Some("null")), Redirect::Null);
        assert_eq!(redirect_from(Some("out.log")), Redirect::file("out.log"));
    }

    #[test]
    fn trailing_arguments_go_to_the_child() {
        let cli = Cli::try_parse_from([
            "procguard-run",
            "--timeout",
            "5",
            "--env",
            "A=1",
            "cc",
            "-c",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(cli.program.as_deref(), Some("cc"));
        assert_eq!(cli.args, vec![OsString::from("-c"), OsString::from("--verbose")]);
        assert_eq!(cli.verbose, 0);
        assert!(exec_options(&cli).env.is_some());
    }

    #[test]
    fn negative_statuses_exit_with_one() {
        assert_eq!(exit_code_for(0), 0);
        assert_eq!(exit_code_for(7), 7);
        assert_eq!(exit_code_for(-2), 1);
        assert_eq!(exit_code_for(0xC000_0005u32 as i32), 1);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn crash_flag_is_refused_in_release_builds() {
        let err = crash().unwrap_err();
        assert!(err.to_string().contains("debug builds"), "{err}");
    }
}

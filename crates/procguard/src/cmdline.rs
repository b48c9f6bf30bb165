//! Native command-line construction.
//!
//! Arguments are escaped so that the conventional argv tokenizer
//! ([`split_command_line`]) yields the original bytes back. Length counting and
//! byte writing share one routine ([`escape_into`]) parameterized over an
//! [`EscapeSink`], so the buffer is sized exactly before anything is written.

/// Upper bound for a flattened command line, including the terminating NUL.
pub const MAX_COMMAND_LINE_LEN: usize = 32768;

/// Linux refuses any single argument of 32 pages or more (`MAX_ARG_STRLEN`).
#[cfg(target_os = "linux")]
const MAX_ARG_STRLEN: usize = 32 * 4096;

const QUOTE_TRIGGERS: &[u8] = b"\t \"&'()*<>\\`^|";

/// Destination for escaped bytes.
pub trait EscapeSink {
    fn put(&mut self, byte: u8);

    fn put_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.put(b);
        }
    }

    fn put_repeat(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.put(byte);
        }
    }
}

/// Sink that only measures.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingSink {
    pub len: usize,
}

impl EscapeSink for CountingSink {
    fn put(&mut self, _byte: u8) {
        self.len += 1;
    }

    fn put_slice(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }

    fn put_repeat(&mut self, _byte: u8, count: usize) {
        self.len += count;
    }
}

impl EscapeSink for Vec<u8> {
    fn put(&mut self, byte: u8) {
        self.push(byte);
    }

    fn put_slice(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }

    fn put_repeat(&mut self, byte: u8, count: usize) {
        self.resize(self.len() + count, byte);
    }
}

/// True if `arg` must be wrapped in quotes to survive tokenization.
pub fn needs_quoting(arg: &[u8]) -> bool {
    arg.is_empty() || arg.iter().any(|b| QUOTE_TRIGGERS.contains(b))
}

/// Escape one argument into `sink`.
///
/// A run of backslashes is doubled when it precedes a `"` (which is then
/// escaped itself) or the closing quote; anywhere else it is copied as is.
pub fn escape_into<S: EscapeSink + ?Sized>(sink: &mut S, arg: &[u8]) {
    if !needs_quoting(arg) {
        sink.put_slice(arg);
        return;
    }

    sink.put(b'"');
    let mut backslashes = 0usize;
    for &b in arg {
        match b {
            b'\\' => backslashes += 1,
            b'"' => {
                sink.put_repeat(b'\\', backslashes * 2 + 1);
                sink.put(b'"');
                backslashes = 0;
            }
            other => {
                sink.put_repeat(b'\\', backslashes);
                sink.put(other);
                backslashes = 0;
            }
        }
    }
    sink.put_repeat(b'\\', backslashes * 2);
    sink.put(b'"');
}

pub fn escaped_len(arg: &[u8]) -> usize {
    let mut counter = CountingSink::default();
    escape_into(&mut counter, arg);
    counter.len
}

pub fn write_escaped(out: &mut Vec<u8>, arg: &[u8]) {
    escape_into(out, arg);
}

/// Length of the command line [`build_command_line`] would produce.
pub fn command_line_len<I, S>(args: I) -> usize
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut counter = CountingSink::default();
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            counter.put(b' ');
        }
        escape_into(&mut counter, arg.as_ref());
    }
    counter.len
}

/// Join `args` into a single escaped command line.
pub fn build_command_line<S: AsRef<[u8]>>(args: &[S]) -> Vec<u8> {
    let mut out = Vec::with_capacity(command_line_len(args));
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        escape_into(&mut out, arg.as_ref());
    }
    out
}

/// Split a command line the way the conventional C runtime tokenizer does.
///
/// Whitespace (space, tab) outside quotes separates arguments. `2n`
/// backslashes before a quote give `n` backslashes and toggle quoting; `2n+1`
/// give `n` backslashes and a literal quote. Inside quotes `""` is a literal
/// quote. Other backslashes are literal.
pub fn split_command_line(line: &[u8]) -> Vec<Vec<u8>> {
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        while i < line.len() && matches!(line[i], b' ' | b'\t') {
            i += 1;
        }
        if i == line.len() {
            break;
        }

        let mut current = Vec::new();
        let mut in_quotes = false;
        while i < line.len() {
            match line[i] {
                b' ' | b'\t' if !in_quotes => break,
                b'\\' => {
                    let run = line[i..].iter().take_while(|&&b| b == b'\\').count();
                    i += run;
                    if line.get(i) == Some(&b'"') {
                        current.resize(current.len() + run / 2, b'\\');
                        if run % 2 == 1 {
                            current.push(b'"');
                            i += 1;
                        }
                    } else {
                        current.resize(current.len() + run, b'\\');
                    }
                }
                b'"' => {
                    if in_quotes && line.get(i + 1) == Some(&b'"') {
                        current.push(b'"');
                        i += 2;
                    } else {
                        in_quotes = !in_quotes;
                        i += 1;
                    }
                }
                other => {
                    current.push(other);
                    i += 1;
                }
            }
        }
        args.push(current);
    }

    args
}

/// Pre-spawn check that `args` (program name first) can be passed to a child.
///
/// The flattened command line must fit [`MAX_COMMAND_LINE_LEN`] on every
/// platform. POSIX hosts additionally keep the raw argv under half of
/// `ARG_MAX`, leaving the other half for the environment.
pub fn arguments_fit_within_system_limits<S: AsRef<[u8]>>(args: &[S]) -> bool {
    if command_line_len(args) + 1 > MAX_COMMAND_LINE_LEN {
        return false;
    }
    #[cfg(unix)]
    {
        if !fits_posix_arg_max(args) {
            return false;
        }
    }
    true
}

#[cfg(unix)]
fn fits_posix_arg_max<S: AsRef<[u8]>>(args: &[S]) -> bool {
    // POSIX guarantees at least 4096.
    let arg_max = match unsafe { libc::sysconf(libc::_SC_ARG_MAX) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    let half = arg_max / 2;
    let mut total = 0usize;
    for arg in args {
        let arg = arg.as_ref();
        #[cfg(target_os = "linux")]
        if arg.len() >= MAX_ARG_STRLEN {
            return false;
        }
        total += arg.len() + 1;
        if total > half {
            return false;
        }
    }
    true
}

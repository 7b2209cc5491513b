//! Directive-line parsing: turns one configuration line into a registered
//! [`Service`] (spec.md section 4.4 step 5, section 6, section 9 Open
//! Questions).
//!
//! A line looks like:
//!
//! ```text
//! service [@user[:group]] [[2345]] [<net/eth0/up>] /path/to/cmd arg1 arg2 \
//!     [:instance] [log] [pid[:[!]/path]] [name:display] [manual:yes] \
//!     [halt:SIGNAME] [kill:5] [env:/etc/default/foo] [cgroup[.group][:k v]] \
//!     -- human readable description
//! ```
//!
//! Tokens after the mandatory `<kind> <cmd>` pair may appear in any order
//! and are recognised by a fixed prefix/bracket shape, matching the
//! original's tolerant, order-independent directive grammar. Anything from
//! the first standalone `--` token onward is the (unexpanded, verbatim)
//! description.

use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::signal::Signal;

/// Parse a signal name for the `halt:` directive. Accepts both the bare
/// name (`TERM`) and the `SIG`-prefixed name (`SIGTERM`), case-insensitive.
/// Limited to the signals a graceful stop could plausibly use; anything
/// else is almost certainly a typo, not an exotic request.
fn parse_signal_name(raw: &str) -> Result<Signal, ConfigError> {
    let upper = raw.trim().to_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    let sig = match bare {
        "HUP" => Signal::SIGHUP,
        "INT" => Signal::SIGINT,
        "QUIT" => Signal::SIGQUIT,
        "TERM" => Signal::SIGTERM,
        "KILL" => Signal::SIGKILL,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        "CONT" => Signal::SIGCONT,
        "STOP" => Signal::SIGSTOP,
        "ALRM" => Signal::SIGALRM,
        _ => return Err(ConfigError::UnknownSignal(raw.to_string())),
    };
    Ok(sig)
}

use crate::cond::CondExpr;
use crate::constants::{
    ARG_METACHAR_LEADERS, KILL_DELAY_MAX_SECS, KILL_DELAY_MIN_SECS, MAX_ARG_LEN, MAX_COND_LEN,
    MAX_NUM_SVC_ARGS,
};
use crate::error::ConfigError;
use crate::service::{CgroupSpec, PidFilePolicy, RunlevelMask, Service, ServiceKind};

/// Word-expand a raw argument string into a bounded argv.
///
/// Grammar (spec section 9 Open Question 3, resolved here rather than left
/// heuristic): whitespace separates words; `'...'` takes everything
/// literally until the matching quote; `"..."` takes everything literally
/// except that `\"` and `\\` are unescaped; outside any quoting, `\` escapes
/// the following character. No variable or glob expansion is performed —
/// the core never shells out to interpret `$VAR` or `*`, so nothing in this
/// grammar needs to either. A word beginning with one of
/// [`ARG_METACHAR_LEADERS`] while unquoted is rejected: those characters
/// only have well-defined meaning here when the author explicitly quotes
/// them, so an unquoted leading occurrence is almost always a mistake
/// (a stray `>` or `&` left over from a copy-pasted shell command line).
pub fn word_expand(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = raw.chars().peekable();

    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::None => match c {
                ' ' | '\t' | '\n' => {
                    if in_word {
                        push_word(&mut words, &mut current, raw)?;
                        in_word = false;
                    }
                }
                '\'' => {
                    if !in_word && current.is_empty() {
                        check_leader(c, raw)?;
                    }
                    in_word = true;
                    quote = Quote::Single;
                }
                '"' => {
                    if !in_word && current.is_empty() {
                        check_leader(c, raw)?;
                    }
                    in_word = true;
                    quote = Quote::Double;
                }
                '\\' => {
                    in_word = true;
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                other => {
                    if !in_word {
                        check_leader(other, raw)?;
                    }
                    in_word = true;
                    current.push(other);
                }
            },
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                    current.push(chars.next().expect("peeked"));
                }
                other => current.push(other),
            },
        }
        if current.len() > MAX_ARG_LEN {
            return Err(ConfigError::ArgExpansionOverflow(
                raw.to_string(),
                format!("argument exceeds {MAX_ARG_LEN} bytes"),
            ));
        }
    }
    if in_word {
        push_word(&mut words, &mut current, raw)?;
    }

    if words.len() > MAX_NUM_SVC_ARGS {
        return Err(ConfigError::ArgExpansionOverflow(
            raw.to_string(),
            format!("more than {MAX_NUM_SVC_ARGS} arguments"),
        ));
    }
    Ok(words)
}

fn check_leader(c: char, raw: &str) -> Result<(), ConfigError> {
    if ARG_METACHAR_LEADERS.contains(&c) {
        return Err(ConfigError::ArgExpansionOverflow(
            raw.to_string(),
            format!("unquoted argument may not begin with '{c}'"),
        ));
    }
    Ok(())
}

fn push_word(words: &mut Vec<String>, current: &mut String, raw: &str) -> Result<(), ConfigError> {
    if current.len() > MAX_ARG_LEN {
        return Err(ConfigError::ArgExpansionOverflow(
            raw.to_string(),
            format!("argument exceeds {MAX_ARG_LEN} bytes"),
        ));
    }
    words.push(std::mem::take(current));
    Ok(())
}

/// Parse one directive line and construct the [`Service`] it describes.
/// `origin_file` is recorded on the result for default cgroup naming and
/// reload scoping; it is not read from the line itself.
pub fn parse_line(line: &str, origin_file: Option<PathBuf>) -> Result<Service, ConfigError> {
    let line = line.trim();
    let (body, description) = match line.split_once("--") {
        Some((b, d)) => (b.trim(), Some(d.trim().to_string())),
        None => (line, None),
    };

    let tokens = word_expand(body)?;
    let mut iter = tokens.into_iter();
    let kind_tok = iter.next().ok_or_else(|| ConfigError::Incomplete(line.to_string()))?;
    let kind = ServiceKind::from_str(&kind_tok.to_uppercase())
        .map_err(|_| ConfigError::Incomplete(format!("unknown service kind '{kind_tok}'")))?;

    let mut user: Option<String> = None;
    let mut group: Option<String> = None;
    let mut runlevels = RunlevelMask::empty();
    let mut cond_expr = CondExpr::default();
    let mut id = String::new();
    let mut cmd: Option<String> = None;
    let mut argv: Vec<String> = Vec::new();
    let mut name: Option<String> = None;
    let mut manual = false;
    let mut halt_signal: Option<Signal> = None;
    let mut kill_delay: Option<std::time::Duration> = None;
    let mut env_file: Option<PathBuf> = None;
    let mut pid_file = PidFilePolicy::Default;
    let mut cgroup: Option<CgroupSpec> = None;
    let mut output = crate::service::OutputPolicy::Null;

    for tok in iter {
        if cmd.is_none() {
            if let Some(rest) = tok.strip_prefix('@') {
                let (u, g) = match rest.split_once(':') {
                    Some((u, g)) => (u.to_string(), Some(g.to_string())),
                    None => (rest.to_string(), None),
                };
                user = Some(u);
                group = g;
                continue;
            }
            if tok.starts_with('[') && tok.ends_with(']') {
                let body = &tok[1..tok.len() - 1];
                for ch in body.chars() {
                    if let Some(n) = ch.to_digit(10) {
                        runlevels = runlevels.with_level(n as u8);
                    } else if ch.eq_ignore_ascii_case(&'s') {
                        runlevels = runlevels.with_bootstrap();
                    }
                }
                continue;
            }
            if tok.starts_with('<') && tok.ends_with('>') {
                cond_expr = CondExpr::parse(&tok[1..tok.len() - 1])?;
                continue;
            }
            // First token that isn't one of the above prefix forms is the
            // command path; everything after it (until a recognised
            // trailing keyword) is its argv.
            cmd = Some(tok);
            continue;
        }

        if let Some(rest) = tok.strip_prefix(':') {
            id = rest.to_string();
            continue;
        }
        if tok == "log" || tok.starts_with("log:") {
            let spec = parse_logger_opts(tok.strip_prefix("log:"));
            output = crate::service::OutputPolicy::Logger(spec);
            continue;
        }
        if tok == "pid" || tok.starts_with("pid:") {
            pid_file = parse_pid_directive(tok.strip_prefix("pid:"))?;
            continue;
        }
        if let Some(rest) = tok.strip_prefix("name:") {
            name = Some(rest.to_string());
            continue;
        }
        if tok == "manual:yes" {
            manual = true;
            continue;
        }
        if let Some(rest) = tok.strip_prefix("halt:") {
            halt_signal = Some(parse_signal_name(rest)?);
            continue;
        }
        if let Some(rest) = tok.strip_prefix("kill:") {
            let secs: u64 = rest.parse().map_err(|_| ConfigError::KillDelayOutOfRange(0))?;
            if !(KILL_DELAY_MIN_SECS..=KILL_DELAY_MAX_SECS).contains(&secs) {
                return Err(ConfigError::KillDelayOutOfRange(secs));
            }
            kill_delay = Some(std::time::Duration::from_secs(secs));
            continue;
        }
        if let Some(rest) = tok.strip_prefix("env:") {
            env_file = Some(PathBuf::from(rest.trim_start_matches('-')));
            continue;
        }
        if tok == "cgroup" || tok.starts_with("cgroup.") || tok.starts_with("cgroup:") {
            cgroup = Some(parse_cgroup_directive(&tok)?);
            continue;
        }

        // Not a recognised keyword: still part of the command's argv.
        argv.push(tok);
    }

    let cmd = cmd.ok_or_else(|| ConfigError::Incomplete(line.to_string()))?;
    if argv.len() > MAX_NUM_SVC_ARGS {
        return Err(ConfigError::ArgExpansionOverflow(
            cmd.clone(),
            format!("more than {MAX_NUM_SVC_ARGS} arguments"),
        ));
    }

    let mut svc = Service::new(cmd, id, kind);
    svc.argv = argv;
    svc.user = user;
    svc.group = group;
    svc.runlevels = runlevels;
    svc.cond_expr = cond_expr;
    svc.description = description.or(name);
    svc.origin_file = origin_file;
    svc.output = output;
    svc.pid_file = pid_file;
    svc.env_file = env_file;
    svc.cgroup = cgroup;
    svc.runtime.manual_stop = manual;
    if let Some(sig) = halt_signal {
        svc.halt_signal = sig;
    }
    if let Some(kd) = kill_delay {
        svc.kill_delay = kd;
    }
    if svc.provides.is_none() {
        svc.provides = Some(svc.default_provided_key());
    }
    Ok(svc)
}

fn parse_logger_opts(opts: Option<&str>) -> crate::service::LoggerSpec {
    let mut spec = crate::service::LoggerSpec::default();
    let Some(opts) = opts else { return spec };
    for kv in opts.split(',') {
        let kv = kv.trim();
        if let Some((k, v)) = kv.split_once('=') {
            match k {
                "file" => spec.file = Some(PathBuf::from(v)),
                "size" => spec.size = v.parse().ok(),
                "rotate" => spec.rotate = v.parse().ok(),
                "tag" => spec.tag = Some(v.to_string()),
                "priority" => spec.priority = Some(v.to_string()),
                _ => {}
            }
        }
    }
    spec
}

/// Resolve Open Question 3's sibling case: the `pid:` directive's own
/// mini-grammar (`pid` alone, `pid:!` for self-managed, `pid:/path` for an
/// explicit location).
fn parse_pid_directive(rest: Option<&str>) -> Result<PidFilePolicy, ConfigError> {
    match rest {
        None => Ok(PidFilePolicy::Default),
        Some(r) if r == "!" => Ok(PidFilePolicy::SelfManaged),
        Some(r) if r.starts_with('/') => Ok(PidFilePolicy::Explicit(PathBuf::from(r))),
        Some(r) => Err(ConfigError::InvalidPath {
            directive: "pid",
            path: r.to_string(),
        }),
    }
}

/// Resolve Open Question 2: the cgroup settings bound is checked against
/// [`CgroupSpec::settings`] specifically (the free-form `key value` lines),
/// not the directive token as a whole — the group name and dotted suffix
/// are already bounded by ordinary path-length limits elsewhere.
fn parse_cgroup_directive(tok: &str) -> Result<CgroupSpec, ConfigError> {
    let rest = tok.strip_prefix("cgroup").unwrap_or(tok);
    let (group_part, settings_part) = match rest.split_once(':') {
        Some((g, s)) => (g, Some(s)),
        None => (rest, None),
    };
    let group = group_part.strip_prefix('.').map(|g| g.to_string());
    let settings = settings_part.unwrap_or("").replace(';', "\n");
    if settings.len() > MAX_COND_LEN {
        return Err(ConfigError::CgroupSettingsTooLong(tok.to_string(), MAX_COND_LEN));
    }
    Ok(CgroupSpec { group, settings })
}

// src/parser.rs
//
// Turns one line of command text into a validated Job. Tokenization is
// shell-style: whitespace separators, balanced single/double quotes,
// backslash escapes. Dispatch walks a record table keyed by verb, picking
// the record whose arity and URL kinds (remote/local) match; a wildcard
// source then promotes the operation to its batch variant. `&&` and `||`
// chain follow-on jobs onto the preceding one.

use crate::error::{JobError, JobResult};
use crate::job::Job;
use crate::object_url::ObjectUrl;
use crate::op::Operation;
use crate::options::{Opt, OptionList};

fn perr(line: &str, msg: impl Into<String>) -> JobError {
    JobError::Parse {
        line: line.to_owned(),
        msg: msg.into(),
    }
}

/// Shell-style tokenization. Quotes group, backslash escapes the next
/// character outside single quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    #[derive(PartialEq)]
    enum State {
        Plain,
        Single,
        Double,
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut state = State::Plain;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Plain => match c {
                '\'' => {
                    state = State::Single;
                    in_token = true;
                }
                '"' => {
                    state = State::Double;
                    in_token = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        in_token = true;
                    }
                    None => return Err("trailing backslash".to_owned()),
                },
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
            State::Single => match c {
                '\'' => state = State::Plain,
                c => current.push(c),
            },
            State::Double => match c {
                '"' => state = State::Plain,
                '\\' => match chars.next() {
                    Some(next) => current.push(next),
                    None => return Err("trailing backslash".to_owned()),
                },
                c => current.push(c),
            },
        }
    }
    if state != State::Plain {
        return Err("unbalanced quote".to_owned());
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlKind {
    Remote,
    Local,
}

impl UrlKind {
    fn accepts(self, url: &ObjectUrl) -> bool {
        match self {
            UrlKind::Remote => url.is_remote(),
            UrlKind::Local => !url.is_remote(),
        }
    }
}

/// What a wildcard source means for this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wild {
    /// Promote to the batch variant and run through the coordinator.
    Promote,
    /// The handler streams the lister itself; no promotion.
    Native,
    Reject,
}

struct CmdRecord {
    verb: &'static str,
    operation: Operation,
    src_kind: UrlKind,
    min_src: usize,
    max_src: Option<usize>,
    dst_kind: Option<UrlKind>,
    wild: Wild,
    accepts: &'static [Opt],
}

const COPY_OPTS: &[Opt] = &[
    Opt::IfNotExists,
    Opt::IfSizeDiffer,
    Opt::IfSourceNewer,
    Opt::Parents,
    Opt::ReducedRedundancy,
    Opt::InfrequentAccess,
];

/// The verb table: one record per (operation, arity, URL-kind) combination.
const COMMANDS: &[CmdRecord] = &[
    // cp / mv: the four transfer directions.
    CmdRecord { verb: "cp", operation: Operation::Copy, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Remote), wild: Wild::Promote, accepts: COPY_OPTS },
    CmdRecord { verb: "cp", operation: Operation::Download, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Local), wild: Wild::Promote, accepts: COPY_OPTS },
    CmdRecord { verb: "cp", operation: Operation::Upload, src_kind: UrlKind::Local, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Remote), wild: Wild::Reject, accepts: COPY_OPTS },
    CmdRecord { verb: "cp", operation: Operation::LocalCopy, src_kind: UrlKind::Local, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Local), wild: Wild::Reject, accepts: COPY_OPTS },
    CmdRecord { verb: "mv", operation: Operation::Copy, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Remote), wild: Wild::Promote, accepts: COPY_OPTS },
    CmdRecord { verb: "mv", operation: Operation::Download, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Local), wild: Wild::Promote, accepts: COPY_OPTS },
    CmdRecord { verb: "mv", operation: Operation::Upload, src_kind: UrlKind::Local, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Remote), wild: Wild::Reject, accepts: COPY_OPTS },
    CmdRecord { verb: "mv", operation: Operation::LocalCopy, src_kind: UrlKind::Local, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Local), wild: Wild::Reject, accepts: COPY_OPTS },
    // get: download with an implied `.` destination.
    CmdRecord { verb: "get", operation: Operation::Download, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: Some(UrlKind::Local), wild: Wild::Promote, accepts: COPY_OPTS },
    // rm: remote or local, any number of sources.
    CmdRecord { verb: "rm", operation: Operation::Delete, src_kind: UrlKind::Remote, min_src: 1, max_src: None, dst_kind: None, wild: Wild::Promote, accepts: &[] },
    CmdRecord { verb: "rm", operation: Operation::LocalDelete, src_kind: UrlKind::Local, min_src: 1, max_src: None, dst_kind: None, wild: Wild::Promote, accepts: &[] },
    // listings and metadata: their handlers stream the lister directly.
    CmdRecord { verb: "ls", operation: Operation::ListBuckets, src_kind: UrlKind::Remote, min_src: 0, max_src: Some(0), dst_kind: None, wild: Wild::Native, accepts: &[] },
    CmdRecord { verb: "ls", operation: Operation::List, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: None, wild: Wild::Native, accepts: &[Opt::Recursive] },
    CmdRecord { verb: "du", operation: Operation::Size, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: None, wild: Wild::Native, accepts: &[] },
    CmdRecord { verb: "size", operation: Operation::Size, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: None, wild: Wild::Native, accepts: &[] },
    CmdRecord { verb: "cat", operation: Operation::Cat, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: None, wild: Wild::Reject, accepts: &[] },
    CmdRecord { verb: "head", operation: Operation::Head, src_kind: UrlKind::Remote, min_src: 1, max_src: Some(1), dst_kind: None, wild: Wild::Reject, accepts: &[] },
];

/// Parse one line into a Job. Blank lines and comments yield `None`.
/// `&&`/`||` sequences come back as one job with chained follow-ons.
pub fn parse_line(line: &str) -> JobResult<Option<Job>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    // Shell escape hatch: everything after `!` goes to `sh -c` verbatim.
    if let Some(rest) = trimmed.strip_prefix('!') {
        let cmd = rest.trim();
        if cmd.is_empty() {
            return Err(perr(trimmed, "missing shell command after '!'"));
        }
        let job = Job::new(
            trimmed,
            "!",
            Operation::ShellExec,
            Vec::new(),
            None,
            OptionList::new(),
        )
        .with_raw_arg(cmd);
        return Ok(Some(job));
    }

    let tokens = tokenize(trimmed).map_err(|msg| perr(trimmed, msg))?;
    if tokens.is_empty() {
        return Ok(None);
    }

    // Split into chain segments around `&&` / `||`.
    #[derive(Clone, Copy)]
    enum ChainOp {
        OnSuccess,
        OnFailure,
    }
    let mut segments: Vec<(Option<ChainOp>, Vec<String>)> = vec![(None, Vec::new())];
    for token in tokens {
        match token.as_str() {
            "&&" => segments.push((Some(ChainOp::OnSuccess), Vec::new())),
            "||" => segments.push((Some(ChainOp::OnFailure), Vec::new())),
            _ => segments.last_mut().unwrap().1.push(token),
        }
    }

    let mut jobs: Vec<(Option<ChainOp>, Job)> = Vec::with_capacity(segments.len());
    for (op, tokens) in segments {
        if tokens.is_empty() {
            return Err(perr(trimmed, "empty command in && / || chain"));
        }
        jobs.push((op, parse_tokens(trimmed, tokens)?));
    }

    // Attach right-to-left: each segment chains onto the one before it.
    while jobs.len() > 1 {
        let (op, job) = jobs.pop().unwrap();
        let prev = &mut jobs.last_mut().unwrap().1;
        match op {
            Some(ChainOp::OnSuccess) => prev.success_job = Some(Box::new(job)),
            Some(ChainOp::OnFailure) => prev.fail_job = Some(Box::new(job)),
            None => unreachable!("only the first segment has no operator"),
        }
    }
    Ok(Some(jobs.pop().unwrap().1))
}

fn parse_tokens(line: &str, tokens: Vec<String>) -> JobResult<Job> {
    let (verb, rest) = tokens
        .split_first()
        .ok_or_else(|| perr(line, "empty command"))?;

    // A `!` segment inside a chain: the rest of the segment is the shell
    // command. (A line *starting* with `!` never reaches here: the whole
    // remainder, operators included, goes to the shell.)
    if *verb == "!" {
        let cmd = rest.join(" ");
        if cmd.is_empty() {
            return Err(perr(line, "missing shell command after '!'"));
        }
        return Ok(Job::new(
            line,
            "!",
            Operation::ShellExec,
            Vec::new(),
            None,
            OptionList::new(),
        )
        .with_raw_arg(cmd));
    }

    let mut opts = OptionList::new();
    let mut positionals: Vec<&str> = Vec::new();
    for token in rest {
        if token.len() > 1 && token.starts_with('-') {
            match Opt::from_flag(token) {
                Some(opt) => opts.add(opt),
                None => return Err(perr(line, format!("unknown flag {token:?}"))),
            }
        } else {
            positionals.push(token);
        }
    }
    if opts.has(Opt::Help) {
        return Err(perr(line, format!("help requested for {verb:?}")));
    }

    match verb.as_str() {
        "exit" => {
            let code = match positionals.as_slice() {
                [] => 0,
                [code] => code
                    .parse::<i32>()
                    .map_err(|_| perr(line, format!("invalid exit code {code:?}")))?,
                _ => return Err(perr(line, "exit takes at most one argument")),
            };
            return Ok(
                Job::new(line, "exit", Operation::Exit, Vec::new(), None, opts)
                    .with_raw_arg(code.to_string()),
            );
        }
        "abort-on-any-error" => {
            if !positionals.is_empty() {
                return Err(perr(line, "abort-on-any-error takes no arguments"));
            }
            return Ok(Job::new(
                line,
                "abort-on-any-error",
                Operation::AbortOnError,
                Vec::new(),
                None,
                opts,
            ));
        }
        _ => {}
    }

    // `get url` implies the current directory as destination.
    let mut positionals = positionals;
    if *verb == "get" && positionals.len() == 1 {
        positionals.push(".");
    }

    let recursive = opts.has(Opt::Recursive);
    let urls: Vec<ObjectUrl> = positionals
        .iter()
        .map(|p| ObjectUrl::parse_opts(p, recursive).map_err(|e| perr(line, e.to_string())))
        .collect::<JobResult<_>>()?;

    let mut known_verb = false;
    let record = COMMANDS.iter().find(|r| {
        if r.verb != *verb {
            return false;
        }
        known_verb = true;
        let (srcs, dst) = match r.dst_kind {
            Some(_) if urls.is_empty() => return false,
            Some(_) => urls.split_at(urls.len() - 1),
            None => (urls.as_slice(), &[] as &[ObjectUrl]),
        };
        if srcs.len() < r.min_src || r.max_src.is_some_and(|max| srcs.len() > max) {
            return false;
        }
        if !srcs.iter().all(|u| r.src_kind.accepts(u)) {
            return false;
        }
        if let (Some(kind), [dst_url]) = (r.dst_kind, dst) {
            if !kind.accepts(dst_url) {
                return false;
            }
        }
        true
    });

    let Some(record) = record else {
        return Err(if known_verb {
            perr(line, format!("invalid arguments for {verb:?}"))
        } else {
            perr(line, format!("unknown command {verb:?}"))
        });
    };

    for opt in [
        Opt::IfNotExists,
        Opt::IfSizeDiffer,
        Opt::IfSourceNewer,
        Opt::Parents,
        Opt::Recursive,
        Opt::ReducedRedundancy,
        Opt::InfrequentAccess,
    ] {
        if opts.has(opt) && !record.accepts.contains(&opt) {
            return Err(perr(
                line,
                format!(
                    "flag {} is not valid for {verb:?}",
                    opt.flag().unwrap_or("?")
                ),
            ));
        }
    }

    let mut opts = opts;
    if *verb == "mv" {
        opts.add(Opt::DeleteSource);
    }

    let (src, dst) = if record.dst_kind.is_some() {
        let mut urls = urls;
        let dst = urls.pop();
        (urls, dst)
    } else {
        (urls, None)
    };

    if dst.as_ref().is_some_and(ObjectUrl::is_wildcard) {
        return Err(perr(line, "destination cannot contain wildcards"));
    }

    let mut operation = record.operation;
    if src.iter().any(ObjectUrl::is_wildcard) {
        match record.wild {
            Wild::Promote => {
                if src.len() > 1 {
                    return Err(perr(line, "a wildcard must be the only source"));
                }
                operation = operation.batch_variant().ok_or_else(|| {
                    perr(line, format!("wildcard source is not supported for {verb:?}"))
                })?;
            }
            Wild::Native => {}
            Wild::Reject => {
                return Err(perr(
                    line,
                    format!("wildcard source is not supported for {verb:?}"),
                ));
            }
        }
    }

    let command = format!("{verb}{}", opts.get_params());
    Ok(Job::new(line, command, operation, src, dst, opts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(line: &str) -> Job {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn tokenize_quoting() {
        assert_eq!(
            tokenize(r#"cp "a file.txt" 'b c' d\ e"#).unwrap(),
            vec!["cp", "a file.txt", "b c", "d e"]
        );
        assert!(tokenize(r#"cp "unbalanced"#).is_err());
        assert!(tokenize(r"cp trailing\").is_err());
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# a comment").unwrap().is_none());
    }

    #[test]
    fn cp_dispatches_on_url_kinds() {
        assert_eq!(job("cp s3://b/a s3://b/c").operation(), Operation::Copy);
        assert_eq!(job("cp s3://b/a /tmp/c").operation(), Operation::Download);
        assert_eq!(job("cp /tmp/a s3://b/c").operation(), Operation::Upload);
        assert_eq!(job("cp /tmp/a /tmp/c").operation(), Operation::LocalCopy);
    }

    #[test]
    fn mv_adds_delete_source() {
        let j = job("mv /tmp/a /tmp/b");
        assert_eq!(j.operation(), Operation::LocalCopy);
        assert!(j.opts().has(Opt::DeleteSource));
    }

    #[test]
    fn get_implies_current_directory() {
        let j = job("get s3://b/key.bin");
        assert_eq!(j.operation(), Operation::Download);
        assert_eq!(j.dst().unwrap().path(), ".");
    }

    #[test]
    fn wildcard_promotes_to_batch() {
        assert_eq!(
            job("cp s3://b/logs/*.txt /tmp/out/").operation(),
            Operation::BatchDownload
        );
        assert_eq!(
            job("cp s3://b/logs/*.txt s3://b/copy/").operation(),
            Operation::BatchCopy
        );
        assert_eq!(job("rm s3://b/logs/*").operation(), Operation::BatchDelete);
        assert_eq!(job("rm /tmp/x/*.log").operation(), Operation::BatchLocalDelete);
    }

    #[test]
    fn listing_verbs_take_wildcards_natively() {
        assert_eq!(job("ls s3://b/logs/*").operation(), Operation::List);
        assert_eq!(job("du s3://b/prefix/*").operation(), Operation::Size);
    }

    #[test]
    fn wildcard_upload_is_rejected() {
        assert!(parse_line("cp /tmp/*.log s3://b/p/").is_err());
        assert!(parse_line("cat s3://b/*.txt").is_err());
    }

    #[test]
    fn rm_accepts_multiple_sources_of_one_kind() {
        let j = job("rm s3://b/a s3://b/c");
        assert_eq!(j.operation(), Operation::Delete);
        assert_eq!(j.src().len(), 2);
        assert!(parse_line("rm s3://b/a /tmp/c").is_err());
    }

    #[test]
    fn listing_verbs() {
        assert_eq!(job("ls").operation(), Operation::ListBuckets);
        assert_eq!(job("ls s3://b/prefix/").operation(), Operation::List);
        assert_eq!(job("size s3://b/p/").operation(), Operation::Size);
        assert_eq!(job("cat s3://b/key").operation(), Operation::Cat);
        assert_eq!(job("head s3://b/key").operation(), Operation::Head);
    }

    #[test]
    fn unknown_verb_and_arity_errors() {
        assert!(matches!(
            parse_line("frobnicate x"),
            Err(JobError::Parse { .. })
        ));
        assert!(parse_line("cp /tmp/a").is_err());
        assert!(parse_line("du").is_err());
    }

    #[test]
    fn flags_are_validated_per_verb() {
        assert!(job("cp -n -s /tmp/a /tmp/b").opts().has(Opt::IfSizeDiffer));
        assert!(parse_line("rm -n s3://b/a").is_err());
        assert!(parse_line("cp -x /tmp/a /tmp/b").is_err());
    }

    #[test]
    fn shell_exec_keeps_raw_remainder() {
        let j = job("! echo 'hello world'");
        assert_eq!(j.operation(), Operation::ShellExec);
        assert_eq!(j.to_string(), "! echo 'hello world'");
    }

    #[test]
    fn exit_parses_code() {
        assert_eq!(job("exit 5").operation(), Operation::Exit);
        assert_eq!(job("exit").operation(), Operation::Exit);
        assert!(parse_line("exit five").is_err());
    }

    #[test]
    fn chains_attach_to_success_and_failure_slots() {
        let j = job("cp /tmp/a /tmp/b && rm /tmp/a");
        assert_eq!(j.operation(), Operation::LocalCopy);
        let chained = j.success_job.as_ref().unwrap();
        assert_eq!(chained.operation(), Operation::LocalDelete);
        assert!(j.fail_job.is_none());

        let j = job("cp /tmp/a /tmp/b || ! echo failed");
        assert_eq!(j.fail_job.as_ref().unwrap().operation(), Operation::ShellExec);

        assert!(parse_line("cp /tmp/a /tmp/b &&").is_err());
    }

    #[test]
    fn parsing_is_pure() {
        let a = job("cp -n s3://b/x /tmp/y");
        let b = job("cp -n s3://b/x /tmp/y");
        assert_eq!(a.operation(), b.operation());
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.opts(), b.opts());
    }
}

//! Query primitives: the ten aggregation queries, expressed as ordered scans
//! and grouped iteration over the catalogue's indexes, plus the batch runner
//! that maps query lines to output files.

use crate::catalog::{Catalog, EngineError};
use crate::datetime::Stamp;
use crate::lazy::Lazy;
use crate::types::{commit_bin, repo_bin, user_bin};
use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::io::{self, Write};
use std::path::Path;
use tracing::warn;

// ---------------------------------------------------------------------------
// Query grammar
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    /// 1 — the three kind counts.
    KindCounts,
    /// 2 — average collaborator appearances per repo with commits.
    CollaboratorAverage,
    /// 3 — repos with at least one bot commit.
    BotRepoCount,
    /// 4 — commits per account.
    CommitsPerAccount,
    /// 5 N start end — top accounts by commit count in the interval.
    TopAccountsByActivity { n: usize, start: Stamp, end: Stamp },
    /// 6 N language — top accounts by commits in repos of a language.
    TopAccountsByLanguage { n: usize, language: String },
    /// 7 date — repos whose last commit precedes the date.
    InactiveReposSince { date: Stamp },
    /// 8 N date — top languages among repos committed to since the date.
    TopLanguagesSince { n: usize, date: Stamp },
    /// 9 N — top accounts committing to repos owned by a friend.
    TopFriendCommitters { n: usize },
    /// 10 N — per repo, accounts with the longest commit message.
    LongestMessages { n: usize },
}

impl Query {
    /// Parse one batch line: a query id followed by its arguments.
    pub fn parse(line: &str) -> Result<Query, EngineError> {
        let mut it = line.split_whitespace();
        let id = it.next().ok_or_else(|| invalid(line, "empty line"))?;
        let args: Vec<&str> = it.collect();
        let arity = |want: usize| -> Result<(), EngineError> {
            if args.len() == want {
                Ok(())
            } else {
                Err(invalid(line, "wrong argument count"))
            }
        };
        match id {
            "1" => {
                arity(0)?;
                Ok(Query::KindCounts)
            }
            "2" => {
                arity(0)?;
                Ok(Query::CollaboratorAverage)
            }
            "3" => {
                arity(0)?;
                Ok(Query::BotRepoCount)
            }
            "4" => {
                arity(0)?;
                Ok(Query::CommitsPerAccount)
            }
            "5" => {
                arity(3)?;
                Ok(Query::TopAccountsByActivity {
                    n: parse_n(line, args[0])?,
                    start: parse_date(line, args[1])?,
                    end: parse_date(line, args[2])?,
                })
            }
            "6" => {
                if args.len() < 2 {
                    return Err(invalid(line, "wrong argument count"));
                }
                // Language names may contain spaces ("Jupyter Notebook").
                Ok(Query::TopAccountsByLanguage {
                    n: parse_n(line, args[0])?,
                    language: args[1..].join(" "),
                })
            }
            "7" => {
                arity(1)?;
                Ok(Query::InactiveReposSince { date: parse_date(line, args[0])? })
            }
            "8" => {
                arity(2)?;
                Ok(Query::TopLanguagesSince {
                    n: parse_n(line, args[0])?,
                    date: parse_date(line, args[1])?,
                })
            }
            "9" => {
                arity(1)?;
                Ok(Query::TopFriendCommitters { n: parse_n(line, args[0])? })
            }
            "10" => {
                arity(1)?;
                Ok(Query::LongestMessages { n: parse_n(line, args[0])? })
            }
            _ => Err(invalid(line, "unknown query id")),
        }
    }
}

fn invalid(line: &str, why: &str) -> EngineError {
    EngineError::InvalidQuery(format!("{why}: {line:?}"))
}

fn parse_n(line: &str, text: &str) -> Result<usize, EngineError> {
    text.parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(line, "bad count"))
}

fn parse_date(line: &str, text: &str) -> Result<Stamp, EngineError> {
    Stamp::parse_date(text).ok_or_else(|| invalid(line, "bad date"))
}

// ---------------------------------------------------------------------------
// Insertion-ordered counter
// ---------------------------------------------------------------------------

/// Counter whose top-N ties keep first-seen order, making every ranking
/// deterministic for a fixed catalogue.
struct Counter<K: Eq + Hash + Clone> {
    slots: Vec<(K, u64)>,
    index: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone> Counter<K> {
    fn new() -> Self {
        Counter { slots: Vec::new(), index: HashMap::new() }
    }

    fn add(&mut self, key: K) {
        match self.index.get(&key) {
            Some(&i) => self.slots[i].1 += 1,
            None => {
                self.index.insert(key.clone(), self.slots.len());
                self.slots.push((key, 1));
            }
        }
    }

    /// Keep the maximum value seen per key instead of summing.
    fn raise(&mut self, key: K, value: u64) {
        match self.index.get(&key) {
            Some(&i) => {
                if value > self.slots[i].1 {
                    self.slots[i].1 = value;
                }
            }
            None => {
                self.index.insert(key.clone(), self.slots.len());
                self.slots.push((key, value));
            }
        }
    }

    /// All entries, highest count first; the sort is stable so equal counts
    /// stay in first-seen order.
    fn ranked(mut self) -> Vec<(K, u64)> {
        self.slots.sort_by(|a, b| b.1.cmp(&a.1));
        self.slots
    }

    fn top(self, n: usize) -> Vec<(K, u64)> {
        let mut ranked = self.ranked();
        ranked.truncate(n);
        ranked
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Execute one query against a fully built catalogue, writing its rows to
/// `out`.
pub fn execute(cat: &Catalog, query: &Query, out: &mut dyn Write) -> io::Result<()> {
    match query {
        Query::KindCounts => {
            let counts = cat.stats.kind_counts;
            writeln!(out, "Bot: {}", counts[crate::types::AccountKind::Bot.ordinal()])?;
            writeln!(out, "Organization: {}", counts[crate::types::AccountKind::Organization.ordinal()])?;
            writeln!(out, "User: {}", counts[crate::types::AccountKind::User.ordinal()])
        }
        Query::CollaboratorAverage => writeln!(out, "{:.2}", cat.stats.avg_collaborators),
        Query::BotRepoCount => writeln!(out, "{}", cat.stats.bot_repo_count as u64),
        Query::CommitsPerAccount => writeln!(out, "{:.2}", cat.stats.commits_per_account),
        Query::TopAccountsByActivity { n, start, end } => {
            top_accounts_by_activity(cat, *n, *start, *end, out)
        }
        Query::TopAccountsByLanguage { n, language } => {
            top_accounts_by_language(cat, *n, language, out)
        }
        Query::InactiveReposSince { date } => inactive_repos_since(cat, *date, out),
        Query::TopLanguagesSince { n, date } => top_languages_since(cat, *n, *date, out),
        Query::TopFriendCommitters { n } => top_friend_committers(cat, *n, out),
        Query::LongestMessages { n } => longest_messages(cat, *n, out),
    }
}

fn login_of(cat: &Catalog, view: &mut Lazy<'_>, id: u32) -> String {
    if cat.users_by_id.find_value_as_view(&cat.cache, &(id as u64), view) {
        view.text(&cat.cache, user_bin::LOGIN).to_string()
    } else {
        String::new()
    }
}

fn write_account_rows(cat: &Catalog, rows: Vec<(u32, u64)>, out: &mut dyn Write) -> io::Result<()> {
    let mut account_view = Lazy::new(&cat.users_fmt, cat.users_file, 0);
    for (id, count) in rows {
        let login = login_of(cat, &mut account_view, id);
        writeln!(out, "{id};{login};{count}")?;
    }
    Ok(())
}

/// Q5: ordered scan of commits-by-date over `[start, end 23:59:59]`,
/// counting each commit once for its author and once for a distinct
/// committer.
fn top_accounts_by_activity(
    cat: &Catalog,
    n: usize,
    start: Stamp,
    end: Stamp,
    out: &mut dyn Write,
) -> io::Result<()> {
    let cache = &cat.cache;
    let end_key = end.end_of_day().raw() as u64;
    let mut counts: Counter<u32> = Counter::new();
    let mut view = Lazy::new(&cat.commits_fmt, cat.commits_file, 0);

    let mut ord = cat.commits_by_date.lower_bound(cache, &(start.raw() as u64));
    while ord < cat.commits_by_date.element_count() {
        if cat.commits_by_date.key_at(cache, ord) > end_key {
            break;
        }
        cat.commits_by_date.value_as_view(cache, ord, &mut view);
        let author = view.u32(cache, commit_bin::AUTHOR);
        let committer = view.u32(cache, commit_bin::COMMITTER);
        counts.add(author);
        if committer != author {
            counts.add(committer);
        }
        ord += 1;
    }
    write_account_rows(cat, counts.top(n), out)
}

/// Q6: resolve the language group, then walk each repo's commit group.
fn top_accounts_by_language(
    cat: &Catalog,
    n: usize,
    language: &str,
    out: &mut dyn Write,
) -> io::Result<()> {
    let cache = &cat.cache;
    let probe = language.to_ascii_lowercase().into_bytes();
    let Some(ord) = cat.repos_by_language.find(cache, probe.as_slice()) else {
        return Ok(());
    };
    let group = cat.repos_by_language.value_at(cache, ord);

    let mut counts: Counter<u32> = Counter::new();
    let mut repo_view = Lazy::new(&cat.repos_fmt, cat.repos_file, 0);
    let mut commit_view = Lazy::new(&cat.commits_fmt, cat.commits_file, 0);

    for i in 0..cat.repos_by_language.group_size(cache, group) {
        cat.repos_by_language.group_elem_as_view(cache, group, i, &mut repo_view);
        let repo_id = repo_view.u32(cache, repo_bin::ID) as u64;
        let Some(r) = cat.commits_by_repo.find(cache, &repo_id) else {
            continue;
        };
        let commits = cat.commits_by_repo.value_at(cache, r);
        for j in 0..cat.commits_by_repo.group_size(cache, commits) {
            cat.commits_by_repo.group_elem_as_view(cache, commits, j, &mut commit_view);
            let author = commit_view.u32(cache, commit_bin::AUTHOR);
            let committer = commit_view.u32(cache, commit_bin::COMMITTER);
            counts.add(author);
            if committer != author {
                counts.add(committer);
            }
        }
    }
    write_account_rows(cat, counts.top(n), out)
}

/// Q7: everything strictly below the bound in last-commit order, oldest
/// first. Repos that never saw a commit sort below every real stamp.
fn inactive_repos_since(cat: &Catalog, date: Stamp, out: &mut dyn Write) -> io::Result<()> {
    let cache = &cat.cache;
    let stop = cat.repos_by_last_commit.lower_bound(cache, &(date.raw() as u64));
    let mut view = Lazy::new(&cat.repos_fmt, cat.repos_file, 0);
    for ord in 0..stop {
        cat.repos_by_last_commit.value_as_view(cache, ord, &mut view);
        let id = view.u32(cache, repo_bin::ID);
        writeln!(out, "{id};{}", view.text(cache, repo_bin::DESCRIPTION))?;
    }
    Ok(())
}

/// Q8: commits since the date, counted per repo language; the literal
/// `none` never takes a slot in the top-N.
fn top_languages_since(cat: &Catalog, n: usize, date: Stamp, out: &mut dyn Write) -> io::Result<()> {
    let cache = &cat.cache;
    let mut counts: Counter<String> = Counter::new();
    let mut commit_view = Lazy::new(&cat.commits_fmt, cat.commits_file, 0);
    let mut repo_view = Lazy::new(&cat.repos_fmt, cat.repos_file, 0);
    // Language per repo id, resolved once.
    let mut languages: HashMap<u32, String> = HashMap::new();

    let mut ord = cat.commits_by_date.lower_bound(cache, &(date.raw() as u64));
    while ord < cat.commits_by_date.element_count() {
        cat.commits_by_date.value_as_view(cache, ord, &mut commit_view);
        let repo_id = commit_view.u32(cache, commit_bin::REPO);
        ord += 1;
        let language = match languages.get(&repo_id) {
            Some(l) => l.clone(),
            None => {
                if !cat
                    .repos_by_id
                    .find_value_as_view(cache, &(repo_id as u64), &mut repo_view)
                {
                    continue;
                }
                let l = repo_view.text(cache, repo_bin::LANGUAGE).to_string();
                languages.insert(repo_id, l.clone());
                l
            }
        };
        counts.add(language);
    }

    let mut emitted = 0usize;
    for (language, _) in counts.ranked() {
        if emitted == n {
            break;
        }
        if language == "none" {
            continue;
        }
        writeln!(out, "{language}")?;
        emitted += 1;
    }
    Ok(())
}

/// Q9: linear scan over the compressed commits using the persisted friend
/// flags; no friend-list lookups at query time.
fn top_friend_committers(cat: &Catalog, n: usize, out: &mut dyn Write) -> io::Result<()> {
    let cache = &cat.cache;
    let len = cache.file_len(cat.commits_file);
    let mut counts: Counter<u32> = Counter::new();
    let mut view = Lazy::new(&cat.commits_fmt, cat.commits_file, 0);
    let mut pos = 0u64;
    while pos < len {
        view.rebind(pos);
        let author = view.u32(cache, commit_bin::AUTHOR);
        let committer = view.u32(cache, commit_bin::COMMITTER);
        if view.flag(cache, commit_bin::AUTHOR_FRIEND) {
            counts.add(author);
        }
        if committer != author && view.flag(cache, commit_bin::COMMITTER_FRIEND) {
            counts.add(committer);
        }
        pos = view.position_after(cache);
    }
    write_account_rows(cat, counts.top(n), out)
}

/// Q10: per repo group, the maximum message length observed per account,
/// reported N rows per repo in repo-id order. Message lengths come from the
/// length field; the message bytes are never read.
fn longest_messages(cat: &Catalog, n: usize, out: &mut dyn Write) -> io::Result<()> {
    let cache = &cat.cache;
    let mut commit_view = Lazy::new(&cat.commits_fmt, cat.commits_file, 0);
    let mut account_view = Lazy::new(&cat.users_fmt, cat.users_file, 0);

    for g in 0..cat.commits_by_repo.element_count() {
        let repo_id = cat.commits_by_repo.key_at(cache, g);
        let group = cat.commits_by_repo.value_at(cache, g);
        let mut best: Counter<u32> = Counter::new();
        for i in 0..cat.commits_by_repo.group_size(cache, group) {
            cat.commits_by_repo.group_elem_as_view(cache, group, i, &mut commit_view);
            let author = commit_view.u32(cache, commit_bin::AUTHOR);
            let committer = commit_view.u32(cache, commit_bin::COMMITTER);
            let msg_len = commit_view.u32(cache, commit_bin::MESSAGE_LEN) as u64;
            best.raise(author, msg_len);
            if committer != author {
                best.raise(committer, msg_len);
            }
        }
        for (account, max_len) in best.top(n) {
            let login = login_of(cat, &mut account_view, account);
            writeln!(out, "{account};{login};{max_len};{repo_id}")?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Batch runner
// ---------------------------------------------------------------------------

/// Run a batch file of queries, one per line, writing each valid line's
/// output to `command<N>_output.txt` (N is the 1-indexed line number) in the
/// catalogue's output directory. Invalid lines are skipped and produce no
/// file. Returns the number of queries executed.
pub fn run_batch(cat: &Catalog, queries_path: &Path) -> Result<u64, EngineError> {
    let content = fs::read_to_string(queries_path)?;
    let mut executed = 0u64;
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Query::parse(line) {
            Ok(q) => {
                let mut buf = Vec::new();
                execute(cat, &q, &mut buf)?;
                fs::write(
                    cat.config.output_path(&format!("command{}_output.txt", i + 1)),
                    buf,
                )?;
                executed += 1;
            }
            Err(e) => warn!(line = i + 1, error = %e, "skipping invalid query"),
        }
    }
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_query_shape() {
        assert_eq!(Query::parse("1").unwrap(), Query::KindCounts);
        assert_eq!(Query::parse("4").unwrap(), Query::CommitsPerAccount);
        assert_eq!(
            Query::parse("5 10 2020-01-01 2020-12-31").unwrap(),
            Query::TopAccountsByActivity {
                n: 10,
                start: Stamp::parse_date("2020-01-01").unwrap(),
                end: Stamp::parse_date("2020-12-31").unwrap(),
            }
        );
        assert_eq!(
            Query::parse("6 3 Jupyter Notebook").unwrap(),
            Query::TopAccountsByLanguage { n: 3, language: "Jupyter Notebook".into() }
        );
        assert_eq!(
            Query::parse("7 2021-06-01").unwrap(),
            Query::InactiveReposSince { date: Stamp::parse_date("2021-06-01").unwrap() }
        );
        assert_eq!(Query::parse("9 5").unwrap(), Query::TopFriendCommitters { n: 5 });
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Query::parse("").is_err());
        assert!(Query::parse("11").is_err());
        assert!(Query::parse("1 extra").is_err());
        assert!(Query::parse("5 10 2020-01-01").is_err());
        assert!(Query::parse("5 0 2020-01-01 2020-12-31").is_err());
        assert!(Query::parse("7 2021-02-30").is_err());
        assert!(Query::parse("6 3").is_err());
    }

    #[test]
    fn counter_breaks_ties_by_first_seen() {
        let mut c: Counter<u32> = Counter::new();
        for k in [7u32, 3, 3, 9, 7, 5] {
            c.add(k);
        }
        // 7 and 3 both have 2; 7 was seen first.
        assert_eq!(c.top(3), vec![(7, 2), (3, 2), (9, 1)]);
    }

    #[test]
    fn counter_raise_keeps_maximum() {
        let mut c: Counter<u32> = Counter::new();
        c.raise(1, 20);
        c.raise(2, 30);
        c.raise(1, 10);
        assert_eq!(c.top(2), vec![(2, 30), (1, 20)]);
    }
}

//! Catalogue builder: ingests the three text inputs, materializes the
//! compressed record files and the full index set, precomputes the scalar
//! aggregates, and persists a small header so later runs can reopen the
//! catalogue without re-ingesting.

use crate::cache::{FileId, PageCache};
use crate::config::EngineConfig;
use crate::datetime::Stamp;
use crate::format::{Format, Value};
use crate::index::{Indexer, NumericKeys, TextKeys};
use crate::lazy::Lazy;
use crate::types::{
    self, account_text, commit_bin, commit_text, repo_bin, repo_text, user_bin, AccountKind,
    REPO_LANGUAGE_FIELD_OFFSET,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt catalogue: {0}")]
    Corrupt(String),
    #[error("invalid query line: {0}")]
    InvalidQuery(String),
}

// ---------------------------------------------------------------------------
// File names
// ---------------------------------------------------------------------------

pub const USERS_CSV: &str = "users.csv";
pub const REPOS_CSV: &str = "repos.csv";
pub const COMMITS_CSV: &str = "commits.csv";

const USERS_DAT: &str = "users.dat";
const REPOS_DAT: &str = "repos.dat";
const COMMITS_DAT: &str = "commits.dat";
const HEADER_DAT: &str = "staticQueries.dat";
const USERS_BY_ID: &str = "usersById.indx";
const REPOS_BY_ID: &str = "reposById.indx";
const COMMITS_BY_REPO: &str = "commitsByRepo.indx";
const COMMITS_BY_REPO_VALUES: &str = "commitsByRepo.dat";
const COMMITS_BY_DATE: &str = "commitsByDate.indx";
const COLLABORATORS: &str = "collaborators.indx";
const COLLABORATORS_VALUES: &str = "collaborators.dat";
const REPOS_BY_LAST_COMMIT: &str = "reposByLastCommit.indx";
const REPOS_BY_LANGUAGE: &str = "reposByLanguage.indx";
const REPOS_BY_LANGUAGE_VALUES: &str = "reposByLanguage.dat";
const STATS_JSON: &str = "catalog_stats.json";

/// Cap on one ingest line; longer lines are truncated and fail validation.
const LINE_MAX: usize = 1 << 16;

// ---------------------------------------------------------------------------
// Persisted header
// ---------------------------------------------------------------------------

/// Aggregates persisted in the 36-byte header: three kind counts, then the
/// three query scalars as big-endian doubles.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StaticStats {
    pub kind_counts: [u32; AccountKind::COUNT],
    /// Average collaborator appearances per repo with commits (Q2).
    pub avg_collaborators: f64,
    /// Repos with at least one bot-authored or bot-committed commit (Q3).
    pub bot_repo_count: f64,
    /// Total commits over total accounts (Q4).
    pub commits_per_account: f64,
}

impl StaticStats {
    const SIZE: usize = 36;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (i, c) in self.kind_counts.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&c.to_be_bytes());
        }
        out[12..20].copy_from_slice(&self.avg_collaborators.to_be_bytes());
        out[20..28].copy_from_slice(&self.bot_repo_count.to_be_bytes());
        out[28..36].copy_from_slice(&self.commits_per_account.to_be_bytes());
        out
    }

    fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let mut kind_counts = [0u32; AccountKind::COUNT];
        for (i, c) in kind_counts.iter_mut().enumerate() {
            *c = u32::from_be_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
        StaticStats {
            kind_counts,
            avg_collaborators: f64::from_be_bytes(raw[12..20].try_into().unwrap()),
            bot_repo_count: f64::from_be_bytes(raw[20..28].try_into().unwrap()),
            commits_per_account: f64::from_be_bytes(raw[28..36].try_into().unwrap()),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub struct Catalog {
    pub cache: PageCache,
    pub config: EngineConfig,
    pub stats: StaticStats,

    pub users_file: FileId,
    pub repos_file: FileId,
    pub commits_file: FileId,
    pub users_fmt: Format,
    pub repos_fmt: Format,
    pub commits_fmt: Format,

    pub users_by_id: Indexer<NumericKeys>,
    pub repos_by_id: Indexer<NumericKeys>,
    pub commits_by_repo: Indexer<NumericKeys>,
    pub commits_by_date: Indexer<NumericKeys>,
    pub collaborators: Indexer<NumericKeys>,
    pub repos_by_last_commit: Indexer<NumericKeys>,
    pub repos_by_language: Indexer<TextKeys>,
}

impl Catalog {
    /// Open the persisted catalogue if every file parses, otherwise rebuild
    /// everything from the text inputs.
    pub fn load_or_build(config: &EngineConfig, force_rebuild: bool) -> Result<Catalog, EngineError> {
        if !force_rebuild {
            match Self::load(config) {
                Ok(cat) => {
                    info!("catalogue opened from persisted files");
                    return Ok(cat);
                }
                Err(e) => debug!(reason = %e, "persisted catalogue unusable, rebuilding"),
            }
        }
        Self::build(config)
    }

    pub fn account_count(&self) -> u64 {
        self.users_by_id.element_count()
    }

    // -----------------------------------------------------------------------
    // Load path
    // -----------------------------------------------------------------------

    fn load(config: &EngineConfig) -> Result<Catalog, EngineError> {
        let stats = read_header(&config.output_path(HEADER_DAT))?;
        let cache = PageCache::new(config.cache_frames);

        let users_file = cache.register(&config.output_path(USERS_DAT), false)?;
        let repos_file = cache.register(&config.output_path(REPOS_DAT), false)?;
        let commits_file = cache.register(&config.output_path(COMMITS_DAT), false)?;

        let users_by_id = Indexer::open(&cache, &config.output_path(USERS_BY_ID), NumericKeys, None)?;
        let repos_by_id = Indexer::open(&cache, &config.output_path(REPOS_BY_ID), NumericKeys, None)?;
        let commits_by_repo = Indexer::open(
            &cache,
            &config.output_path(COMMITS_BY_REPO),
            NumericKeys,
            Some(&config.output_path(COMMITS_BY_REPO_VALUES)),
        )?;
        let commits_by_date =
            Indexer::open(&cache, &config.output_path(COMMITS_BY_DATE), NumericKeys, None)?;
        let collaborators = Indexer::open(
            &cache,
            &config.output_path(COLLABORATORS),
            NumericKeys,
            Some(&config.output_path(COLLABORATORS_VALUES)),
        )?;
        let repos_by_last_commit =
            Indexer::open(&cache, &config.output_path(REPOS_BY_LAST_COMMIT), NumericKeys, None)?;
        let repos_by_language = Indexer::open(
            &cache,
            &config.output_path(REPOS_BY_LANGUAGE),
            TextKeys { keys_file: repos_file },
            Some(&config.output_path(REPOS_BY_LANGUAGE_VALUES)),
        )?;

        Ok(Catalog {
            cache,
            config: config.clone(),
            stats,
            users_file,
            repos_file,
            commits_file,
            users_fmt: types::users_binary_format(),
            repos_fmt: types::repos_binary_format(),
            commits_fmt: types::commits_binary_format(),
            users_by_id,
            repos_by_id,
            commits_by_repo,
            commits_by_date,
            collaborators,
            repos_by_last_commit,
            repos_by_language,
        })
    }

    // -----------------------------------------------------------------------
    // Build path
    // -----------------------------------------------------------------------

    fn build(config: &EngineConfig) -> Result<Catalog, EngineError> {
        let started = Instant::now();
        fs::create_dir_all(&config.output_dir)?;
        let cache = PageCache::new(config.cache_frames);
        let sort_buf = config.sort_buffer_bytes;

        let users_file = cache.create(&config.output_path(USERS_DAT))?;
        let repos_file = cache.create(&config.output_path(REPOS_DAT))?;
        let commits_file = cache.create(&config.output_path(COMMITS_DAT))?;

        let mut users_by_id = Indexer::create(&cache, &config.output_path(USERS_BY_ID), NumericKeys)?;
        let mut repos_by_id = Indexer::create(&cache, &config.output_path(REPOS_BY_ID), NumericKeys)?;
        let mut commits_by_repo =
            Indexer::create(&cache, &config.output_path(COMMITS_BY_REPO), NumericKeys)?;
        let mut commits_by_date =
            Indexer::create(&cache, &config.output_path(COMMITS_BY_DATE), NumericKeys)?;
        let mut collaborators =
            Indexer::create(&cache, &config.output_path(COLLABORATORS), NumericKeys)?;
        let mut repos_by_last_commit =
            Indexer::create(&cache, &config.output_path(REPOS_BY_LAST_COMMIT), NumericKeys)?;
        let mut repos_by_language = Indexer::create(
            &cache,
            &config.output_path(REPOS_BY_LANGUAGE),
            TextKeys { keys_file: repos_file },
        )?;

        // Accounts parse in parallel with the repository-id pre-scan; the
        // commit filter needs both.
        let (accounts_res, prescan_res) = rayon::join(
            || ingest_accounts(&cache, config, users_file, &mut users_by_id),
            || prescan_repo_ids(&cache, config),
        );
        let (kind_counts, account_count) = accounts_res?;
        let (repos_input, repo_ids) = prescan_res?;

        let (commit_count, last_commit) =
            filter_commits(&cache, config, commits_file, &users_by_id, &repo_ids)?;

        let repo_count = ingest_repos(
            &cache,
            repos_input,
            repos_file,
            &users_by_id,
            &last_commit,
            &mut repos_by_id,
            &mut repos_by_last_commit,
            &mut repos_by_language,
        )?;
        drop(last_commit);
        drop(repo_ids);

        fill_commit_indexes(
            &cache,
            commits_file,
            &users_by_id,
            &mut commits_by_date,
            &mut commits_by_repo,
            &mut collaborators,
        )?;

        // Sort and group; the indexers are independent, so the jobs run
        // concurrently.
        let mut r_repos: io::Result<()> = Ok(());
        let mut r_last: io::Result<()> = Ok(());
        let mut r_commit_pair: io::Result<()> = Ok(());
        let mut r_date: io::Result<()> = Ok(());
        let mut r_lang: io::Result<()> = Ok(());
        {
            let cbr_values = config.output_path(COMMITS_BY_REPO_VALUES);
            let collab_values = config.output_path(COLLABORATORS_VALUES);
            let lang_values = config.output_path(REPOS_BY_LANGUAGE_VALUES);
            let cache = &cache;
            rayon::scope(|s| {
                s.spawn(|_| r_repos = repos_by_id.sort(cache, sort_buf));
                s.spawn(|_| r_last = repos_by_last_commit.sort(cache, sort_buf));
                s.spawn(|_| {
                    r_commit_pair = (|| {
                        commits_by_repo.sort(cache, sort_buf)?;
                        commits_by_repo.group(cache, &cbr_values, false)?;
                        collaborators.sort(cache, sort_buf)?;
                        collaborators.group(cache, &collab_values, true)
                    })();
                });
                s.spawn(|_| r_date = commits_by_date.sort(cache, sort_buf));
                s.spawn(|_| {
                    r_lang = (|| {
                        repos_by_language.sort(cache, sort_buf)?;
                        repos_by_language.group(cache, &lang_values, false)
                    })();
                });
            });
        }
        r_repos?;
        r_last?;
        r_commit_pair?;
        r_date?;
        r_lang?;

        let mut catalog = Catalog {
            cache,
            config: config.clone(),
            stats: StaticStats::default(),
            users_file,
            repos_file,
            commits_file,
            users_fmt: types::users_binary_format(),
            repos_fmt: types::repos_binary_format(),
            commits_fmt: types::commits_binary_format(),
            users_by_id,
            repos_by_id,
            commits_by_repo,
            commits_by_date,
            collaborators,
            repos_by_last_commit,
            repos_by_language,
        };

        let bot_repo_count = catalog.fill_friend_flags();
        catalog.stats = StaticStats {
            kind_counts,
            avg_collaborators: catalog.collaborator_average(),
            bot_repo_count: bot_repo_count as f64,
            commits_per_account: if account_count == 0 {
                0.0
            } else {
                commit_count as f64 / account_count as f64
            },
        };
        fs::write(
            config.output_path(HEADER_DAT),
            catalog.stats.to_bytes(),
        )?;
        catalog.cache.flush_all();

        let build_time_ms = started.elapsed().as_millis() as u64;
        write_build_report(
            &config.output_path(STATS_JSON),
            &BuildReport {
                accounts: account_count,
                repositories: repo_count,
                commits: commit_count,
                repos_with_commits: catalog.commits_by_repo.element_count(),
                languages: catalog.repos_by_language.element_count(),
                build_time_ms,
            },
        );
        info!(
            accounts = account_count,
            repositories = repo_count,
            commits = commit_count,
            time_ms = build_time_ms,
            "catalogue built"
        );
        Ok(catalog)
    }

    /// Second pass over commits, repo group by repo group: persist the two
    /// friend flags on every commit and count repos touched by a bot.
    fn fill_friend_flags(&mut self) -> u64 {
        let started = Instant::now();
        let cache = &self.cache;
        let mut commit_view = Lazy::new(&self.commits_fmt, self.commits_file, 0);
        let mut repo_view = Lazy::new(&self.repos_fmt, self.repos_file, 0);
        let mut account_view = Lazy::new(&self.users_fmt, self.users_file, 0);
        let mut bot_repos = 0u64;

        for g in 0..self.commits_by_repo.element_count() {
            let repo_id = self.commits_by_repo.key_at(cache, g);
            let group_off = self.commits_by_repo.value_at(cache, g);

            // A repo dropped at ingest (unknown owner) leaves its commits'
            // flags false.
            let mut owner: Option<(u32, Vec<u32>)> = None;
            if self.repos_by_id.find_value_as_view(cache, &repo_id, &mut repo_view) {
                let owner_id = repo_view.u32(cache, repo_bin::OWNER);
                if self
                    .users_by_id
                    .find_value_as_view(cache, &(owner_id as u64), &mut account_view)
                {
                    owner = Some((owner_id, account_view.ints(cache, user_bin::FRIENDS).to_vec()));
                }
            }

            let size = self.commits_by_repo.group_size(cache, group_off);
            let mut has_bot = false;
            for i in 0..size {
                self.commits_by_repo
                    .group_elem_as_view(cache, group_off, i, &mut commit_view);
                let author = commit_view.u32(cache, commit_bin::AUTHOR);
                let committer = commit_view.u32(cache, commit_bin::COMMITTER);
                if let Some((owner_id, friends)) = &owner {
                    if author != *owner_id && friends.binary_search(&author).is_ok() {
                        commit_view.set(commit_bin::AUTHOR_FRIEND, Value::Bool(true));
                    }
                    if committer != *owner_id && friends.binary_search(&committer).is_ok() {
                        commit_view.set(commit_bin::COMMITTER_FRIEND, Value::Bool(true));
                    }
                    commit_view.flush_to_file(cache);
                }
                if !has_bot {
                    has_bot = self.kind_of(&mut account_view, author) == Some(AccountKind::Bot)
                        || (committer != author
                            && self.kind_of(&mut account_view, committer) == Some(AccountKind::Bot));
                }
            }
            if has_bot {
                bot_repos += 1;
            }
        }
        debug!(time_ms = started.elapsed().as_millis() as u64, "friend flags persisted");
        bot_repos
    }

    fn kind_of(&self, view: &mut Lazy<'_>, account_id: u32) -> Option<AccountKind> {
        if self
            .users_by_id
            .find_value_as_view(&self.cache, &(account_id as u64), view)
        {
            Some(view.kind(&self.cache, user_bin::KIND))
        } else {
            None
        }
    }

    /// Q2 numerator and denominator: deduplicated collaborator appearances
    /// summed over repo groups, divided by the number of groups.
    fn collaborator_average(&self) -> f64 {
        let groups = self.collaborators.element_count();
        if groups == 0 {
            return 0.0;
        }
        let mut appearances = 0u64;
        for g in 0..groups {
            let off = self.collaborators.value_at(&self.cache, g);
            appearances += self.collaborators.group_size(&self.cache, off) as u64;
        }
        appearances as f64 / groups as f64
    }
}

// ---------------------------------------------------------------------------
// Ingest stages
// ---------------------------------------------------------------------------

fn skip_header_line(cache: &PageCache, file: FileId) -> u64 {
    let (_, next) = cache.read_line(file, 0, LINE_MAX);
    next
}

/// Sorted intersection of followers and following. The friends list owns its
/// own allocation, independent of the scratch set.
fn friends_of(followers: &[u32], following: &[u32]) -> Vec<u32> {
    let set: HashSet<u32> = followers.iter().copied().collect();
    let mut out: Vec<u32> = following.iter().copied().filter(|id| set.contains(id)).collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn append_record(
    cache: &PageCache,
    file: FileId,
    pos: &mut u64,
    fmt: &Format,
    rec: &[Value],
    buf: &mut Vec<u8>,
) {
    buf.clear();
    fmt.write_binary(rec, buf);
    cache.set_bytes(file, *pos, buf);
    *pos += buf.len() as u64;
}

/// Stage 1a: parse accounts, derive friends lists, emit `users.dat`, fill and
/// sort the accounts-by-id index, count kinds.
fn ingest_accounts(
    cache: &PageCache,
    config: &EngineConfig,
    users_file: FileId,
    users_by_id: &mut Indexer<NumericKeys>,
) -> Result<([u32; AccountKind::COUNT], u64), EngineError> {
    let started = Instant::now();
    let text_fmt = types::accounts_text_format();
    let bin_fmt = types::users_binary_format();
    let input = cache.register(&config.input_path(USERS_CSV), false)?;
    let len = cache.file_len(input);

    let mut kind_counts = [0u32; AccountKind::COUNT];
    let mut dropped = 0u64;
    let mut out_pos = 0u64;
    let mut buf = Vec::new();
    let mut pos = skip_header_line(cache, input);
    while pos < len {
        let (line, next) = cache.read_line(input, pos, LINE_MAX);
        if next <= pos {
            break;
        }
        pos = next;
        let Ok(line) = std::str::from_utf8(&line) else {
            dropped += 1;
            continue;
        };
        if line.is_empty() {
            continue;
        }
        let Some(rec) = text_fmt.parse(line) else {
            dropped += 1;
            continue;
        };
        let id = rec[account_text::ID].as_u32();
        let kind = rec[account_text::KIND].as_kind();
        let friends = friends_of(
            rec[account_text::FOLLOWERS].as_ints(),
            rec[account_text::FOLLOWING].as_ints(),
        );
        let record = types::user_record(id, rec[account_text::LOGIN].as_text(), kind, friends);
        users_by_id.insert(cache, id as u64, out_pos);
        append_record(cache, users_file, &mut out_pos, &bin_fmt, &record, &mut buf);
        kind_counts[kind.ordinal()] += 1;
    }
    // The commit filter binary-searches this index, so the sort happens here,
    // inside the accounts task.
    users_by_id.sort(cache, config.sort_buffer_bytes)?;
    cache.flush_file(users_file);
    info!(
        accounts = users_by_id.element_count(),
        dropped,
        time_ms = started.elapsed().as_millis() as u64,
        "accounts ingested"
    );
    Ok((kind_counts, users_by_id.element_count()))
}

/// Stage 1b: collect every repository id in the text input. Commits are
/// accepted against this unfiltered set.
fn prescan_repo_ids(
    cache: &PageCache,
    config: &EngineConfig,
) -> Result<(FileId, HashSet<u32>), EngineError> {
    let input = cache.register(&config.input_path(REPOS_CSV), false)?;
    let len = cache.file_len(input);
    let mut ids = HashSet::new();
    let mut pos = skip_header_line(cache, input);
    while pos < len {
        let (line, next) = cache.read_line(input, pos, LINE_MAX);
        if next <= pos {
            break;
        }
        pos = next;
        // Only the leading id field matters here.
        if let Some(field) = line.split(|&b| b == b';').next() {
            if let Ok(text) = std::str::from_utf8(field) {
                if let Ok(id) = text.parse::<u32>() {
                    ids.insert(id);
                }
            }
        }
    }
    debug!(repo_ids = ids.len(), "repository ids pre-scanned");
    Ok((input, ids))
}

/// Stage 2: stream commits, keeping only those whose author and committer are
/// known accounts and whose repo id appears in the input. Tracks the newest
/// commit stamp per repo for the last-commit backfill.
fn filter_commits(
    cache: &PageCache,
    config: &EngineConfig,
    commits_file: FileId,
    users_by_id: &Indexer<NumericKeys>,
    repo_ids: &HashSet<u32>,
) -> Result<(u64, HashMap<u32, Stamp>), EngineError> {
    let started = Instant::now();
    let text_fmt = types::commits_text_format();
    let bin_fmt = types::commits_binary_format();
    let input = cache.register(&config.input_path(COMMITS_CSV), false)?;
    let len = cache.file_len(input);

    let mut last_commit: HashMap<u32, Stamp> = HashMap::new();
    let mut count = 0u64;
    let mut dropped = 0u64;
    let mut out_pos = 0u64;
    let mut buf = Vec::new();
    let mut pos = skip_header_line(cache, input);
    while pos < len {
        let (line, next) = cache.read_line(input, pos, LINE_MAX);
        if next <= pos {
            break;
        }
        pos = next;
        let Ok(line) = std::str::from_utf8(&line) else {
            dropped += 1;
            continue;
        };
        if line.is_empty() {
            continue;
        }
        let Some(rec) = text_fmt.parse(line) else {
            dropped += 1;
            continue;
        };
        let repo = rec[commit_text::REPO].as_u32();
        let author = rec[commit_text::AUTHOR].as_u32();
        let committer = rec[commit_text::COMMITTER].as_u32();
        let known = repo_ids.contains(&repo)
            && users_by_id.find(cache, &(author as u64)).is_some()
            && (committer == author || users_by_id.find(cache, &(committer as u64)).is_some());
        if !known {
            dropped += 1;
            continue;
        }
        let date = rec[commit_text::DATE].as_stamp();
        let record =
            types::commit_record(repo, author, committer, date, rec[commit_text::MESSAGE].as_text());
        append_record(cache, commits_file, &mut out_pos, &bin_fmt, &record, &mut buf);
        count += 1;
        last_commit
            .entry(repo)
            .and_modify(|s| {
                if date > *s {
                    *s = date;
                }
            })
            .or_insert(date);
    }
    cache.flush_file(commits_file);
    info!(
        commits = count,
        dropped,
        time_ms = started.elapsed().as_millis() as u64,
        "commits filtered"
    );
    Ok((count, last_commit))
}

/// Stage 3: stream repositories, keeping those with a known owner; lowercase
/// the language, backfill the last-commit stamp, emit `repos.dat` and fill
/// the three repo indexes (unsorted).
#[allow(clippy::too_many_arguments)]
fn ingest_repos(
    cache: &PageCache,
    input: FileId,
    repos_file: FileId,
    users_by_id: &Indexer<NumericKeys>,
    last_commit: &HashMap<u32, Stamp>,
    repos_by_id: &mut Indexer<NumericKeys>,
    repos_by_last_commit: &mut Indexer<NumericKeys>,
    repos_by_language: &mut Indexer<TextKeys>,
) -> Result<u64, EngineError> {
    let started = Instant::now();
    let text_fmt = types::repos_text_format();
    let bin_fmt = types::repos_binary_format();
    let len = cache.file_len(input);

    let mut count = 0u64;
    let mut dropped = 0u64;
    let mut out_pos = 0u64;
    let mut buf = Vec::new();
    let mut pos = skip_header_line(cache, input);
    while pos < len {
        let (line, next) = cache.read_line(input, pos, LINE_MAX);
        if next <= pos {
            break;
        }
        pos = next;
        let Ok(line) = std::str::from_utf8(&line) else {
            dropped += 1;
            continue;
        };
        if line.is_empty() {
            continue;
        }
        let Some(rec) = text_fmt.parse(line) else {
            dropped += 1;
            continue;
        };
        let id = rec[repo_text::ID].as_u32();
        let owner = rec[repo_text::OWNER].as_u32();
        if users_by_id.find(cache, &(owner as u64)).is_none() {
            dropped += 1;
            continue;
        }
        let language = rec[repo_text::LANGUAGE].as_text().to_ascii_lowercase();
        let last = last_commit.get(&id).copied().unwrap_or(Stamp::NEVER);
        let record = types::repo_record(&rec, language, last);

        let offset = out_pos;
        append_record(cache, repos_file, &mut out_pos, &bin_fmt, &record, &mut buf);
        repos_by_id.insert(cache, id as u64, offset);
        repos_by_last_commit.insert(cache, last.raw() as u64, offset);
        repos_by_language.insert(cache, offset + REPO_LANGUAGE_FIELD_OFFSET, offset);
        count += 1;
    }
    cache.flush_file(repos_file);
    info!(
        repositories = count,
        dropped,
        time_ms = started.elapsed().as_millis() as u64,
        "repositories ingested"
    );
    Ok(count)
}

/// Stage 4: linear scan of the compressed commits through a lazy view,
/// filling the commit-derived indexes (unsorted). The collaborators payload
/// is the account's record offset, resolved through accounts-by-id.
fn fill_commit_indexes(
    cache: &PageCache,
    commits_file: FileId,
    users_by_id: &Indexer<NumericKeys>,
    commits_by_date: &mut Indexer<NumericKeys>,
    commits_by_repo: &mut Indexer<NumericKeys>,
    collaborators: &mut Indexer<NumericKeys>,
) -> Result<(), EngineError> {
    let started = Instant::now();
    let fmt = types::commits_binary_format();
    let len = cache.file_len(commits_file);
    let mut view = Lazy::new(&fmt, commits_file, 0);
    let mut pos = 0u64;
    while pos < len {
        view.rebind(pos);
        let repo = view.u32(cache, commit_bin::REPO) as u64;
        let author = view.u32(cache, commit_bin::AUTHOR);
        let committer = view.u32(cache, commit_bin::COMMITTER);
        let date = view.stamp(cache, commit_bin::DATE).raw() as u64;

        commits_by_date.insert(cache, date, pos);
        commits_by_repo.insert(cache, repo, pos);
        if let Some(ord) = users_by_id.find(cache, &(author as u64)) {
            collaborators.insert(cache, repo, users_by_id.value_at(cache, ord));
        }
        if committer != author {
            if let Some(ord) = users_by_id.find(cache, &(committer as u64)) {
                collaborators.insert(cache, repo, users_by_id.value_at(cache, ord));
            }
        }
        pos = view.position_after(cache);
    }
    debug!(time_ms = started.elapsed().as_millis() as u64, "commit indexes filled");
    Ok(())
}

// ---------------------------------------------------------------------------
// Header and build report
// ---------------------------------------------------------------------------

fn read_header(path: &Path) -> Result<StaticStats, EngineError> {
    let raw = fs::read(path)?;
    let raw: [u8; StaticStats::SIZE] = raw.as_slice().try_into().map_err(|_| {
        EngineError::Corrupt(format!(
            "{}: expected exactly {} bytes",
            path.display(),
            StaticStats::SIZE
        ))
    })?;
    Ok(StaticStats::from_bytes(&raw))
}

/// Informational dump written after a successful build; never read back.
#[derive(Serialize)]
struct BuildReport {
    accounts: u64,
    repositories: u64,
    commits: u64,
    repos_with_commits: u64,
    languages: u64,
    build_time_ms: u64,
}

fn write_build_report(path: &Path, report: &BuildReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                warn!(path = %path.display(), error = %e, "could not write build report");
            }
        }
        Err(e) => warn!(error = %e, "could not serialize build report"),
    }
}

//! End-to-end scenarios: seed the three text inputs, build a catalogue in a
//! temporary working directory, and check query output line for line.

use forgestat_core::lazy::Lazy;
use forgestat_core::types::user_bin;
use forgestat_core::{query, Catalog, EngineConfig, Query};
use std::collections::HashMap;
use std::fmt::Write as _;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: tempfile::TempDir,
    config: EngineConfig,
}

impl Harness {
    fn new(users: &[String], repos: &[String], commits: &[String]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("entrada");
        std::fs::create_dir_all(&input).unwrap();

        let write = |name: &str, header: &str, lines: &[String]| {
            let mut text = String::new();
            writeln!(text, "{header}").unwrap();
            for l in lines {
                writeln!(text, "{l}").unwrap();
            }
            std::fs::write(input.join(name), text).unwrap();
        };
        write(
            "users.csv",
            "id;login;type;created_at;followers;follower_list;following;following_list;public_gists;public_repos",
            users,
        );
        write(
            "repos.csv",
            "id;owner_id;full_name;licence;has_wiki;description;language;default_branch;created_at;updated_at;forks_count;open_issues;stargazers_count;size",
            repos,
        );
        write("commits.csv", "repo_id;author_id;committer_id;commit_at;message", commits);

        let config = EngineConfig {
            input_dir: input,
            output_dir: dir.path().join("saida"),
            cache_frames: 64,
            sort_buffer_bytes: 1 << 20,
        };
        Harness { _dir: dir, config }
    }

    fn build(&self) -> Catalog {
        Catalog::load_or_build(&self.config, true).expect("catalogue build")
    }

    fn reload(&self) -> Catalog {
        Catalog::load_or_build(&self.config, false).expect("catalogue reload")
    }
}

fn run(cat: &Catalog, line: &str) -> String {
    let q = Query::parse(line).expect("query parses");
    let mut out = Vec::new();
    query::execute(cat, &q, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

// Row builders for the three inputs.

fn list(ids: &[u32]) -> String {
    let inner = ids.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
    format!("[{inner}]")
}

fn user(id: u32, kind: &str) -> String {
    user_with(id, kind, &[], &[])
}

fn user_with(id: u32, kind: &str, followers: &[u32], following: &[u32]) -> String {
    format!(
        "{id};user{id};{kind};2015-01-01 00:00:00;{};{};{};{};0;0",
        followers.len(),
        list(followers),
        following.len(),
        list(following),
    )
}

fn repo(id: u32, owner: u32, language: &str, desc: &str) -> String {
    format!(
        "{id};{owner};user{owner}/r{id};MIT;True;{desc};{language};main;2015-01-01 00:00:00;2015-01-02 00:00:00;0;0;0;10"
    )
}

fn commit(repo: u32, author: u32, committer: u32, date: &str, msg: &str) -> String {
    format!("{repo};{author};{committer};{date};{msg}")
}

// ---------------------------------------------------------------------------
// Seeded scenarios
// ---------------------------------------------------------------------------

#[test]
fn kind_counts_by_group() {
    let users = vec![
        user(1, "Bot"),
        user(2, "Bot"),
        user(3, "Organization"),
        user(4, "User"),
        user(5, "User"),
        user(6, "User"),
        user(7, "User"),
        user(8, "User"),
    ];
    let h = Harness::new(&users, &[], &[]);
    let cat = h.build();
    assert_eq!(run(&cat, "1"), "Bot: 2\nOrganization: 1\nUser: 5\n");
}

#[test]
fn collaborator_average_over_repo_groups() {
    let users: Vec<String> = (1..=6).map(|i| user(i, "User")).collect();
    let repos = vec![
        repo(101, 1, "C", "r1"),
        repo(102, 1, "C", "r2"),
        repo(103, 1, "C", "r3"),
    ];
    let mut commits = Vec::new();
    // Appearances per repo: 4, 6, 2 distinct accounts.
    for a in 1..=4 {
        commits.push(commit(101, a, a, "2020-01-10 00:00:00", "m"));
    }
    for a in 1..=6 {
        commits.push(commit(102, a, a, "2020-02-10 00:00:00", "m"));
    }
    for a in 1..=2 {
        commits.push(commit(103, a, a, "2020-03-10 00:00:00", "m"));
    }
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    assert_eq!(run(&cat, "2"), "4.00\n");
}

#[test]
fn top_accounts_by_activity_in_window() {
    let users = vec![user(1, "User"), user(10, "User"), user(20, "User"), user(30, "User")];
    let repos = vec![repo(201, 1, "C", "d")];
    let mut commits = Vec::new();
    for day in 1..=3 {
        commits.push(commit(201, 10, 10, &format!("2020-03-0{day} 10:00:00"), "m"));
    }
    for day in 1..=5 {
        commits.push(commit(201, 20, 20, &format!("2020-06-0{day} 10:00:00"), "m"));
    }
    commits.push(commit(201, 30, 30, "2020-09-01 10:00:00", "m"));
    // Outside the window, must not count.
    commits.push(commit(201, 10, 10, "2019-12-31 23:59:59", "m"));
    commits.push(commit(201, 10, 10, "2021-01-01 00:00:00", "m"));

    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    assert_eq!(run(&cat, "5 2 2020-01-01 2020-12-31"), "20;user20;5\n10;user10;3\n");
}

#[test]
fn inactive_repos_before_date() {
    let users = vec![user(1, "User")];
    let repos = vec![repo(1, 1, "C", "old"), repo(2, 1, "C", "new")];
    let commits = vec![
        commit(1, 1, 1, "2020-05-01 12:00:00", "m"),
        commit(2, 1, 1, "2022-01-01 12:00:00", "m"),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    assert_eq!(run(&cat, "7 2021-06-01"), "1;old\n");
}

#[test]
fn top_languages_skip_the_none_literal() {
    let users = vec![user(1, "User")];
    let repos = vec![
        repo(301, 1, "c", "r"),
        repo(302, 1, "python", "r"),
        repo(303, 1, "none", "r"),
    ];
    let commits = vec![
        commit(301, 1, 1, "2021-02-01 00:00:00", "m"),
        commit(302, 1, 1, "2021-03-01 00:00:00", "m"),
        commit(303, 1, 1, "2021-04-01 00:00:00", "m"),
        commit(301, 1, 1, "2021-05-01 00:00:00", "m"),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    assert_eq!(run(&cat, "8 2 2021-01-01"), "c\npython\n");
}

#[test]
fn longest_message_per_repo() {
    let users = vec![user(1, "User"), user(100, "User"), user(200, "User")];
    let repos = vec![repo(7, 1, "C", "d")];
    let commits = vec![
        commit(7, 100, 100, "2020-01-01 00:00:00", &"a".repeat(20)),
        commit(7, 200, 200, "2020-01-02 00:00:00", &"b".repeat(30)),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    assert_eq!(run(&cat, "10 1"), "200;user200;30;7\n");
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn friend_lists_are_symmetric_and_sorted() {
    // 1↔2 mutual, 1↔3 mutual, 2→3 one-way only.
    let users = vec![
        user_with(1, "User", &[2, 3], &[3, 2]),
        user_with(2, "User", &[1, 3], &[1]),
        user_with(3, "User", &[1], &[1, 2]),
    ];
    let h = Harness::new(&users, &[], &[]);
    let cat = h.build();

    let mut friends: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut view = Lazy::new(&cat.users_fmt, cat.users_file, 0);
    let len = cat.cache.file_len(cat.users_file);
    let mut pos = 0u64;
    while pos < len {
        view.rebind(pos);
        let id = view.u32(&cat.cache, user_bin::ID);
        friends.insert(id, view.ints(&cat.cache, user_bin::FRIENDS).to_vec());
        pos = view.position_after(&cat.cache);
    }

    assert_eq!(friends[&1], vec![2, 3]);
    assert_eq!(friends[&2], vec![1]);
    assert_eq!(friends[&3], vec![1]);
    for (a, list) in &friends {
        let mut sorted = list.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(*list, sorted, "friends of {a} must be sorted and unique");
        for b in list {
            assert!(friends[b].contains(a), "{a} in friends({b}) requires {b} in friends({a})");
        }
    }
}

#[test]
fn friend_commits_use_persisted_flags() {
    let users = vec![
        user_with(1, "User", &[2], &[2]), // owner, friend of 2
        user_with(2, "User", &[1], &[1]),
        user(3, "User"),
    ];
    let repos = vec![repo(401, 1, "C", "d")];
    let commits = vec![
        commit(401, 2, 2, "2020-01-01 00:00:00", "m"),
        commit(401, 2, 2, "2020-01-02 00:00:00", "m"),
        commit(401, 3, 3, "2020-01-03 00:00:00", "m"),
        // The owner committing to their own repo is never a "friend" commit.
        commit(401, 1, 1, "2020-01-04 00:00:00", "m"),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    assert_eq!(run(&cat, "9 5"), "2;user2;2\n");
}

#[test]
fn language_match_is_case_insensitive() {
    let users = vec![user(1, "User"), user(2, "User")];
    let repos = vec![repo(501, 1, "C++", "d"), repo(502, 1, "ruby", "d")];
    let commits = vec![
        commit(501, 1, 1, "2020-01-01 00:00:00", "m"),
        commit(501, 2, 2, "2020-01-02 00:00:00", "m"),
        commit(501, 2, 2, "2020-01-03 00:00:00", "m"),
        commit(502, 1, 1, "2020-01-04 00:00:00", "m"),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();

    let expected = "2;user2;2\n1;user1;1\n";
    for probe in ["C++", "c++", "C++"] {
        assert_eq!(run(&cat, &format!("6 5 {probe}")), expected, "probe {probe}");
    }
}

#[test]
fn reloaded_catalogue_answers_identically() {
    let users = vec![
        user_with(1, "User", &[2], &[2]),
        user_with(2, "Bot", &[1], &[1]),
        user(3, "Organization"),
    ];
    let repos = vec![repo(601, 1, "rust", "stable"), repo(602, 3, "go", "fresh")];
    let commits = vec![
        commit(601, 2, 2, "2020-05-01 00:00:00", "robot work"),
        commit(601, 1, 2, "2020-06-01 00:00:00", "pair"),
        commit(602, 3, 3, "2021-07-01 00:00:00", "init"),
    ];
    let h = Harness::new(&users, &repos, &commits);

    let queries = ["1", "2", "3", "4", "5 3 2020-01-01 2021-12-31", "7 2021-01-01", "8 3 2020-01-01", "9 3", "10 2"];
    let built = h.build();
    let from_build: Vec<String> = queries.iter().map(|q| run(&built, q)).collect();
    drop(built);

    let reloaded = h.reload();
    let from_load: Vec<String> = queries.iter().map(|q| run(&reloaded, q)).collect();
    assert_eq!(from_build, from_load);
}

#[test]
fn bot_repos_and_commit_ratio_land_in_the_header() {
    let users = vec![user(1, "User"), user(2, "Bot"), user(3, "User"), user(4, "User")];
    let repos = vec![repo(701, 1, "C", "d"), repo(702, 1, "C", "d")];
    let commits = vec![
        commit(701, 2, 2, "2020-01-01 00:00:00", "bot here"),
        commit(701, 1, 1, "2020-01-02 00:00:00", "m"),
        commit(702, 1, 1, "2020-01-03 00:00:00", "m"),
        commit(702, 3, 3, "2020-01-04 00:00:00", "m"),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();

    assert_eq!(run(&cat, "3"), "1\n");
    // 4 commits over 4 accounts.
    assert_eq!(run(&cat, "4"), "1.00\n");

    let header = std::fs::read(h.config.output_dir.join("staticQueries.dat")).unwrap();
    assert_eq!(header.len(), 36);
}

#[test]
fn commits_with_unknown_collaborators_are_dropped() {
    let users = vec![user(1, "User"), user(2, "User")];
    let repos = vec![repo(801, 1, "C", "d")];
    let commits = vec![
        commit(801, 1, 1, "2020-01-01 00:00:00", "kept"),
        commit(801, 99, 1, "2020-01-02 00:00:00", "unknown author"),
        commit(801, 1, 99, "2020-01-03 00:00:00", "unknown committer"),
        commit(999, 1, 1, "2020-01-04 00:00:00", "unknown repo"),
    ];
    let h = Harness::new(&users, &repos, &commits);
    let cat = h.build();
    // Only the first commit survives: 1 commit over 2 accounts.
    assert_eq!(run(&cat, "4"), "0.50\n");
}

#[test]
fn batch_runner_numbers_outputs_by_line() {
    let users = vec![user(1, "User")];
    let h = Harness::new(&users, &[], &[]);
    let cat = h.build();

    let queries_path = h.config.output_dir.join("queries.txt");
    std::fs::write(&queries_path, "1\n\nbogus\n4\n").unwrap();
    let executed = query::run_batch(&cat, &queries_path).unwrap();
    assert_eq!(executed, 2);

    assert!(h.config.output_dir.join("command1_output.txt").exists());
    assert!(!h.config.output_dir.join("command2_output.txt").exists());
    assert!(!h.config.output_dir.join("command3_output.txt").exists());
    assert!(h.config.output_dir.join("command4_output.txt").exists());
    assert_eq!(
        std::fs::read_to_string(h.config.output_dir.join("command1_output.txt")).unwrap(),
        "Bot: 0\nOrganization: 0\nUser: 1\n"
    );
}

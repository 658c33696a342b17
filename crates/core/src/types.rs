//! Domain model: account kinds, the field layouts of the three entities in
//! both their text (ingest) and binary (compressed file) shapes, and the
//! conversions from parsed text records to binary records.

use crate::datetime::Stamp;
use crate::format::{field, FieldType, Format, Value};

// ---------------------------------------------------------------------------
// Account kind
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AccountKind {
    User,
    Organization,
    Bot,
}

impl AccountKind {
    pub const COUNT: usize = 3;

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "User" => Some(AccountKind::User),
            "Organization" => Some(AccountKind::Organization),
            "Bot" => Some(AccountKind::Bot),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::User => "User",
            AccountKind::Organization => "Organization",
            AccountKind::Bot => "Bot",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AccountKind::User => 0,
            AccountKind::Organization => 1,
            AccountKind::Bot => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AccountKind::User),
            1 => Some(AccountKind::Organization),
            2 => Some(AccountKind::Bot),
            _ => None,
        }
    }

    pub fn ordinal(self) -> usize {
        self.code() as usize
    }
}

// ---------------------------------------------------------------------------
// Field ordinals
// ---------------------------------------------------------------------------

pub mod account_text {
    pub const ID: usize = 0;
    pub const LOGIN: usize = 1;
    pub const KIND: usize = 2;
    pub const CREATED: usize = 3;
    pub const FOLLOWERS_LEN: usize = 4;
    pub const FOLLOWERS: usize = 5;
    pub const FOLLOWING_LEN: usize = 6;
    pub const FOLLOWING: usize = 7;
    pub const PUBLIC_GISTS: usize = 8;
    pub const PUBLIC_REPOS: usize = 9;
}

pub mod user_bin {
    pub const ID: usize = 0;
    pub const LOGIN_LEN: usize = 1;
    pub const KIND: usize = 2;
    pub const FRIENDS_LEN: usize = 3;
    pub const FRIENDS: usize = 4;
    pub const LOGIN: usize = 5;
}

pub mod repo_text {
    pub const ID: usize = 0;
    pub const OWNER: usize = 1;
    pub const FULL_NAME: usize = 2;
    pub const LICENSE: usize = 3;
    pub const HAS_WIKI: usize = 4;
    pub const DESCRIPTION: usize = 5;
    pub const LANGUAGE: usize = 6;
    pub const DEFAULT_BRANCH: usize = 7;
    pub const CREATED: usize = 8;
    pub const UPDATED: usize = 9;
    pub const FORKS: usize = 10;
    pub const OPEN_ISSUES: usize = 11;
    pub const STARGAZERS: usize = 12;
    pub const SIZE: usize = 13;
}

pub mod repo_bin {
    pub const ID: usize = 0;
    pub const OWNER: usize = 1;
    pub const LAST_COMMIT: usize = 2;
    pub const LANGUAGE_LEN: usize = 3;
    pub const LANGUAGE: usize = 4;
    pub const DESC_LEN: usize = 5;
    pub const DESCRIPTION: usize = 6;
    pub const HAS_WIKI: usize = 7;
    pub const BRANCH_LEN: usize = 8;
    pub const DEFAULT_BRANCH: usize = 9;
    pub const CREATED: usize = 10;
    pub const UPDATED: usize = 11;
    pub const FORKS: usize = 12;
    pub const OPEN_ISSUES: usize = 13;
    pub const STARGAZERS: usize = 14;
    pub const SIZE: usize = 15;
    pub const FULL_NAME_LEN: usize = 16;
    pub const FULL_NAME: usize = 17;
    pub const LICENSE_LEN: usize = 18;
    pub const LICENSE: usize = 19;
}

pub mod commit_text {
    pub const REPO: usize = 0;
    pub const AUTHOR: usize = 1;
    pub const COMMITTER: usize = 2;
    pub const DATE: usize = 3;
    pub const MESSAGE: usize = 4;
}

pub mod commit_bin {
    pub const REPO: usize = 0;
    pub const AUTHOR: usize = 1;
    pub const AUTHOR_FRIEND: usize = 2;
    pub const COMMITTER: usize = 3;
    pub const COMMITTER_FRIEND: usize = 4;
    pub const DATE: usize = 5;
    pub const MESSAGE_LEN: usize = 6;
    pub const MESSAGE: usize = 7;
}

/// Byte offset of the language length field inside a binary repo record
/// (id, owner and last-commit are fixed four-byte fields before it). The
/// language index keys on this offset.
pub const REPO_LANGUAGE_FIELD_OFFSET: u64 = 12;

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

pub fn accounts_text_format() -> Format {
    Format::text(
        ';',
        vec![
            field("id", FieldType::Int),
            field("login", FieldType::Str),
            field("kind", FieldType::Kind),
            field("created_at", FieldType::DateTime),
            field("followers_count", FieldType::Int),
            field("followers", FieldType::IntList),
            field("following_count", FieldType::Int),
            field("following", FieldType::IntList),
            field("public_gists", FieldType::Int),
            field("public_repos", FieldType::Int),
        ],
        &[
            (account_text::FOLLOWERS, account_text::FOLLOWERS_LEN),
            (account_text::FOLLOWING, account_text::FOLLOWING_LEN),
        ],
    )
}

pub fn users_binary_format() -> Format {
    Format::binary(
        vec![
            field("id", FieldType::Int),
            field("login_len", FieldType::Int),
            field("kind", FieldType::Kind),
            field("friends_count", FieldType::Int),
            field("friends", FieldType::IntList),
            field("login", FieldType::Str),
        ],
        &[
            (user_bin::FRIENDS, user_bin::FRIENDS_LEN),
            (user_bin::LOGIN, user_bin::LOGIN_LEN),
        ],
    )
}

pub fn repos_text_format() -> Format {
    Format::text(
        ';',
        vec![
            field("id", FieldType::Int),
            field("owner_id", FieldType::Int),
            field("full_name", FieldType::Str),
            field("license", FieldType::Str),
            field("has_wiki", FieldType::Bool),
            field("description", FieldType::OptStr),
            field("language", FieldType::Str),
            field("default_branch", FieldType::Str),
            field("created_at", FieldType::DateTime),
            field("updated_at", FieldType::DateTime),
            field("forks_count", FieldType::Int),
            field("open_issues", FieldType::Int),
            field("stargazers_count", FieldType::Int),
            field("size", FieldType::Int),
        ],
        &[],
    )
}

pub fn repos_binary_format() -> Format {
    Format::binary(
        vec![
            field("id", FieldType::Int),
            field("owner_id", FieldType::Int),
            field("last_commit", FieldType::DateTime),
            field("language_len", FieldType::Int),
            field("language", FieldType::Str),
            field("desc_len", FieldType::Int),
            field("description", FieldType::OptStr),
            field("has_wiki", FieldType::Bool),
            field("branch_len", FieldType::Int),
            field("default_branch", FieldType::Str),
            field("created_at", FieldType::DateTime),
            field("updated_at", FieldType::DateTime),
            field("forks_count", FieldType::Int),
            field("open_issues", FieldType::Int),
            field("stargazers_count", FieldType::Int),
            field("size", FieldType::Int),
            field("full_name_len", FieldType::Int),
            field("full_name", FieldType::Str),
            field("license_len", FieldType::Int),
            field("license", FieldType::Str),
        ],
        &[
            (repo_bin::LANGUAGE, repo_bin::LANGUAGE_LEN),
            (repo_bin::DESCRIPTION, repo_bin::DESC_LEN),
            (repo_bin::DEFAULT_BRANCH, repo_bin::BRANCH_LEN),
            (repo_bin::FULL_NAME, repo_bin::FULL_NAME_LEN),
            (repo_bin::LICENSE, repo_bin::LICENSE_LEN),
        ],
    )
}

pub fn commits_text_format() -> Format {
    Format::text(
        ';',
        vec![
            field("repo_id", FieldType::Int),
            field("author_id", FieldType::Int),
            field("committer_id", FieldType::Int),
            field("committed_at", FieldType::DateTime),
            field("message", FieldType::OptStr),
        ],
        &[],
    )
}

pub fn commits_binary_format() -> Format {
    Format::binary(
        vec![
            field("repo_id", FieldType::Int),
            field("author_id", FieldType::Int),
            field("author_is_friend", FieldType::Bool),
            field("committer_id", FieldType::Int),
            field("committer_is_friend", FieldType::Bool),
            field("committed_at", FieldType::DateTime),
            field("message_len", FieldType::Int),
            field("message", FieldType::OptStr),
        ],
        &[(commit_bin::MESSAGE, commit_bin::MESSAGE_LEN)],
    )
}

// ---------------------------------------------------------------------------
// Text-to-binary record conversion
// ---------------------------------------------------------------------------

/// Compressed account record. `friends` must already be sorted ascending and
/// deduplicated.
pub fn user_record(id: u32, login: &str, kind: AccountKind, friends: Vec<u32>) -> Vec<Value> {
    vec![
        Value::Int(id),
        Value::Int(login.len() as u32),
        Value::Kind(kind),
        Value::Int(friends.len() as u32),
        Value::IntList(friends),
        Value::Str(login.to_string()),
    ]
}

/// Compressed commit record. The two friend flags start false and are filled
/// in by the second pass over commits.
pub fn commit_record(repo: u32, author: u32, committer: u32, date: Stamp, message: &str) -> Vec<Value> {
    vec![
        Value::Int(repo),
        Value::Int(author),
        Value::Bool(false),
        Value::Int(committer),
        Value::Bool(false),
        Value::DateTime(date),
        Value::Int(message.len() as u32),
        Value::OptStr(message.to_string()),
    ]
}

/// Compressed repo record built from a parsed text record, the lowercased
/// language and the backfilled last-commit stamp.
pub fn repo_record(text: &[Value], language: String, last_commit: Stamp) -> Vec<Value> {
    let description = text[repo_text::DESCRIPTION].as_text().to_string();
    let branch = text[repo_text::DEFAULT_BRANCH].as_text().to_string();
    let full_name = text[repo_text::FULL_NAME].as_text().to_string();
    let license = text[repo_text::LICENSE].as_text().to_string();
    vec![
        Value::Int(text[repo_text::ID].as_u32()),
        Value::Int(text[repo_text::OWNER].as_u32()),
        Value::DateTime(last_commit),
        Value::Int(language.len() as u32),
        Value::Str(language),
        Value::Int(description.len() as u32),
        Value::OptStr(description),
        Value::Bool(text[repo_text::HAS_WIKI].as_bool()),
        Value::Int(branch.len() as u32),
        Value::Str(branch),
        Value::DateTime(text[repo_text::CREATED].as_stamp()),
        Value::DateTime(text[repo_text::UPDATED].as_stamp()),
        Value::Int(text[repo_text::FORKS].as_u32()),
        Value::Int(text[repo_text::OPEN_ISSUES].as_u32()),
        Value::Int(text[repo_text::STARGAZERS].as_u32()),
        Value::Int(text[repo_text::SIZE].as_u32()),
        Value::Int(full_name.len() as u32),
        Value::Str(full_name),
        Value::Int(license.len() as u32),
        Value::Str(license),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for kind in [AccountKind::User, AccountKind::Organization, AccountKind::Bot] {
            assert_eq!(AccountKind::from_code(kind.code()), Some(kind));
            assert_eq!(AccountKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AccountKind::from_code(3), None);
    }

    #[test]
    fn language_field_offset_matches_the_binary_layout() {
        let fmt = repos_binary_format();
        let mut offset = 0u64;
        for i in 0..repo_bin::LANGUAGE_LEN {
            offset += fmt.field_size(i, 0) as u64;
        }
        assert_eq!(offset, REPO_LANGUAGE_FIELD_OFFSET);
    }
}

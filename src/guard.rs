//! Compiled-in deny-list of protected resources.
//!
//! Checked before any classifier runs. Configuration can add entries but the
//! built-in ones are part of the binary and cannot be switched off.
//!
//! Every string in the arguments is matched twice: verbatim, and split into
//! shell-like words that are dequoted, brace-expanded and lexically
//! normalized (`src/./x`, `src//x` and `src/a/../x` all read as `src/x`).
//! Words containing `*`, `?` or `[` are matched as globs against the entries.

use serde_json::Value;

/// Resources no mutating action may mention.
pub const PROTECTED: &[&str] = &[
    "CONSTITUTION.md",
    "BIBLE.md",
    "safety.toml",
    "src/safety.rs",
    "src/guard.rs",
    "safety.py",
];

#[derive(Debug, Clone)]
pub struct Guard {
    /// Lowercased built-in + extra entries.
    entries: Vec<String>,
}

impl Guard {
    pub fn new(extra: &[String]) -> Self {
        let mut entries: Vec<String> = PROTECTED.iter().map(|s| s.to_ascii_lowercase()).collect();
        for e in extra {
            let e = e.trim().to_ascii_lowercase();
            if !e.is_empty() && !entries.contains(&e) {
                entries.push(e);
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// First protected resource mentioned anywhere in `args`, if any.
    pub fn violation(&self, args: &Value) -> Option<&str> {
        let haystack = args.to_string().to_ascii_lowercase();
        let mut words = Vec::new();
        collect_words(args, &mut words);
        self.entries
            .iter()
            .find(|e| haystack.contains(e.as_str()) || words.iter().any(|w| mentions(w, e)))
            .map(String::as_str)
    }
}

const GLOB_CHARS: &[char] = &['*', '?', '['];
const WORD_BREAKS: &[char] = &[';', '|', '&', '<', '>', '(', ')', '`', '='];
const MAX_EXPANSIONS: usize = 64;

fn collect_words(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let dequoted: String = s
                .to_ascii_lowercase()
                .chars()
                .filter(|c| !matches!(c, '\'' | '"' | '\\'))
                .collect();
            for word in dequoted.split(|c: char| c.is_whitespace() || WORD_BREAKS.contains(&c)) {
                let mut expanded = Vec::new();
                expand_braces(word, &mut expanded);
                out.extend(
                    expanded
                        .iter()
                        .flat_map(|w| w.split(','))
                        .filter(|w| !w.is_empty())
                        .map(normalize),
                );
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_words(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_words(v, out)),
        _ => {}
    }
}

/// `a{b,c}d` becomes `abd`, `acd`.
fn expand_braces(word: &str, out: &mut Vec<String>) {
    if out.len() >= MAX_EXPANSIONS {
        return;
    }
    let braces = word
        .find('{')
        .and_then(|open| word[open..].find('}').map(|len| (open, open + len)));
    match braces {
        Some((open, close)) if word[open..close].contains(',') => {
            let (head, tail) = (&word[..open], &word[close + 1..]);
            for alt in word[open + 1..close].split(',') {
                expand_braces(&format!("{head}{alt}{tail}"), out);
            }
        }
        _ => out.push(word.to_string()),
    }
}

/// Lexical path cleanup; never touches the filesystem.
fn normalize(word: &str) -> String {
    let absolute = word.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in word.split('/') {
        match part {
            "" | "." => {}
            ".." if parts.last().is_some_and(|p| *p != "..") => {
                parts.pop();
            }
            ".." if absolute => {}
            p => parts.push(p),
        }
    }
    let mut out = parts.join("/");
    if absolute {
        out.insert(0, '/');
    }
    if word.ends_with('/') && !parts.is_empty() {
        out.push('/');
    }
    out
}

fn mentions(word: &str, entry: &str) -> bool {
    if word.contains(GLOB_CHARS) {
        return glob_mentions(word, entry);
    }
    word.contains(entry)
        || entry
            .strip_suffix('/')
            .is_some_and(|dir| word == dir || word.ends_with(&format!("/{dir}")))
}

/// Whether some run of `pattern`'s components matches `entry` component by
/// component. Runs made only of wildcards never match.
fn glob_mentions(pattern: &str, entry: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
    let target: Vec<&str> = entry.trim_end_matches('/').split('/').collect();
    if target.len() > pattern.len() {
        return false;
    }
    pattern.windows(target.len()).any(|run| {
        run.iter().any(|c| c.chars().any(|ch| !GLOB_CHARS.contains(&ch) && ch != ']'))
            && run.iter().zip(&target).all(|(p, t)| wildcard(p, t))
    })
}

/// Shell-style match of one path component: `*`, `?` and `[...]` classes.
fn wildcard(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() {
            let next = match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => Some(pi + 1),
                '[' => match class(&p[pi..], t[ti]) {
                    Some((true, len)) => Some(pi + len),
                    Some((false, _)) => None,
                    None => (t[ti] == '[').then_some(pi + 1),
                },
                c => (c == t[ti]).then_some(pi + 1),
            };
            if let Some(next) = next {
                pi = next;
                ti += 1;
                continue;
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Match `c` against the class opening `p`; returns (hit, class length).
fn class(p: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 1;
    let negated = matches!(p.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let first = i;
    let mut hit = false;
    while i < p.len() {
        if p[i] == ']' && i > first {
            return Some((hit != negated, i + 1));
        }
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            hit |= (p[i]..=p[i + 2]).contains(&c);
            i += 3;
        } else {
            hit |= p[i] == c;
            i += 1;
        }
    }
    None
}

impl Default for Guard {
    fn default() -> Self {
        Self::new(&[])
    }
}

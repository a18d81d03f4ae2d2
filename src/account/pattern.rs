//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Petramap.
//
// Petramap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Petramap is distributed in the hope that  it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Petramap. If not, see <http://www.gnu.org/licenses/>.

//! The LIST/LSUB wildcard matcher.
//!
//! `%` matches within one hierarchy level, `*` matches across levels; the
//! mailbox separator is `/`.

/// The three-valued result of matching `name` against `pattern`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match {
    /// Neither the name nor any child can match.
    No,
    /// The name does not match, but a child of it may.
    Children,
    /// The name matches.
    Yes,
}

pub fn pattern_match(pattern: &str, name: &str) -> Match {
    match_at(pattern.as_bytes(), 0, name.as_bytes(), 0)
}

// Deliberately naive backtracking; patterns and names are short.
fn match_at(pattern: &[u8], mut p: usize, name: &[u8], mut n: usize) -> Match {
    let mut children = false;

    while p < pattern.len() {
        if b'*' == pattern[p] || b'%' == pattern[p] {
            let mut star = false;
            while p < pattern.len()
                && (b'*' == pattern[p] || b'%' == pattern[p])
            {
                if b'*' == pattern[p] {
                    star = true;
                }
                p += 1;
            }

            // The wildcard may consume anything from nothing up to the rest
            // of the current level (`%`) or the whole name (`*`).
            let mut limit = n;
            if star {
                limit = name.len();
            } else {
                while limit < name.len() && b'/' != name[limit] {
                    limit += 1;
                }
            }

            let mut ix = limit + 1;
            while ix > n {
                ix -= 1;
                match match_at(pattern, p, name, ix) {
                    Match::Yes => return Match::Yes,
                    Match::Children => children = true,
                    Match::No => (),
                }
            }
            return if children { Match::Children } else { Match::No };
        } else if n < name.len() && pattern[p] == name[n] {
            // Literal match, proceed.
        } else if b'/' == pattern[p] && n >= name.len() {
            // Ran out of name where the pattern wants a child.
            return Match::Children;
        } else {
            return Match::No;
        }
        p += 1;
        n += 1;
    }

    if n >= name.len() {
        Match::Yes
    } else {
        Match::No
    }
}

#[cfg(test)]
mod test {
    use super::Match::*;
    use super::*;

    #[test]
    fn wildcard_truth_table() {
        assert_eq!(Yes, pattern_match("a/*", "a/b/c"));
        assert_eq!(No, pattern_match("a/%", "a/b/c"));
        assert_eq!(Yes, pattern_match("a/%", "a/b"));
        assert_eq!(Children, pattern_match("a/%/d", "a/b"));
        assert_eq!(Yes, pattern_match("*", "anything/at/all"));
        assert_eq!(Yes, pattern_match("", ""));
    }

    #[test]
    fn literal_and_prefix_behaviour() {
        assert_eq!(Yes, pattern_match("INBOX", "INBOX"));
        assert_eq!(No, pattern_match("INBOX", "INBOX2"));
        assert_eq!(No, pattern_match("INBOX", "INBO"));
        assert_eq!(Children, pattern_match("a/b", "a"));
        assert_eq!(No, pattern_match("a", "a/b"));
        assert_eq!(Yes, pattern_match("%", "lists"));
        assert_eq!(No, pattern_match("%", "lists/mja"));
        assert_eq!(Children, pattern_match("%/%", "lists"));
        assert_eq!(Yes, pattern_match("%/%", "lists/mja"));
    }

    #[test]
    fn mixed_wildcards_collapse() {
        // %* and *% both behave as *
        assert_eq!(Yes, pattern_match("a/%*", "a/b/c"));
        assert_eq!(Yes, pattern_match("a/*%", "a/b/c"));
    }
}

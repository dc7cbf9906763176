//! Glob matching with redis `KEYS` semantics: `*`, `?`, `[abc]`, `[a-z]`,
//! `[^a]` and backslash escapes.

pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // (position of the last `*`, text index it is currently absorbing up to)
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
            continue;
        }
        if pi < p.len() {
            if let Some(next) = match_one(&p, pi, t[ti]) {
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

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Matches a single character, returning the next pattern index on success.
fn match_one(p: &[char], pi: usize, c: char) -> Option<usize> {
    match p[pi] {
        '?' => Some(pi + 1),
        '[' => match match_class(p, pi, c) {
            Some((true, next)) => Some(next),
            Some((false, _)) => None,
            // unterminated class, treat `[` literally
            None => (c == '[').then_some(pi + 1),
        },
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        literal => (literal == c).then_some(pi + 1),
    }
}

fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && (p[i] == '^' || p[i] == '!');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() {
        match p[i] {
            ']' => return Some((matched != negate, i + 1)),
            '\\' if i + 1 < p.len() => {
                matched |= p[i + 1] == c;
                i += 2;
            }
            lo if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' => {
                let hi = p[i + 2];
                matched |= lo <= c && c <= hi;
                i += 3;
            }
            literal => {
                matched |= literal == c;
                i += 1;
            }
        }
    }
    None
}

// Copyright 2023 Oxide Computer Company
//! gtest style test name filters: `POS1:POS2-NEG1:NEG2` with `*` and `?`.
use crate::phase::Phase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFilter {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl TestFilter {
    pub fn parse(filter: &str) -> Self {
        let (pos, neg) = match filter.split_once('-') {
            Some((p, n)) => (p, n),
            None => (filter, ""),
        };
        let split = |s: &str| -> Vec<String> {
            s.split(':')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        };
        let mut positive = split(pos);
        if positive.is_empty() {
            positive.push("*".to_string());
        }
        TestFilter {
            positive,
            negative: split(neg),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.positive.iter().any(|p| glob_match(p, name))
            && !self.negative.iter().any(|p| glob_match(p, name))
    }
}

/// Does `pattern` name `phase` itself, and not a phase whose number only
/// starts with the same digits?
fn names_phase(pattern: &str, phase: &str) -> bool {
    pattern.match_indices(phase).any(|(i, _)| {
        !pattern[i + phase.len()..]
            .starts_with(|c: char| c.is_ascii_digit())
    })
}

/// Restrict `filter` to the tests of `phase`.
///
/// Every positive pattern `P` becomes `P*phase_N*`; patterns that already
/// name the phase are left alone so applying this twice changes nothing.
pub fn phase_filter(filter: &str, phase: Phase) -> String {
    let name = phase.name();
    let (pos, neg) = match filter.split_once('-') {
        Some((p, n)) => (p, Some(n)),
        None => (filter, None),
    };

    let mut restricted: Vec<String> = pos
        .split(':')
        .filter(|p| !p.is_empty())
        .map(|p| {
            if names_phase(p, &name) {
                p.to_string()
            } else {
                format!("{}*{}*", p, name)
            }
        })
        .collect();
    if restricted.is_empty() {
        restricted.push(format!("*{}*", name));
    }

    let mut out = restricted.join(":");
    if let Some(neg) = neg {
        out.push('-');
        out.push_str(neg);
    }
    out
}

/// Shell style wildcard match over chars; `*` spans anything, `?` one char.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0, 0);
    // Where to resume after the most recent `*`.
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod test {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn glob_basics() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("Suite.*", "Suite.Case"));
        assert!(!glob_match("Suite.*", "Other.Case"));
        assert!(glob_match("*_phase_2*", "Basic.TRY_OPEN_OBJ_phase_2"));
        assert!(glob_match("*a*b*c", "xxaxxbxxc"));
        assert!(!glob_match("*a*b*c", "xxaxxcxxb"));
    }

    #[test]
    fn filter_positive_and_negative() {
        let f = TestFilter::parse("Basic.*:Move*-*DIRTY*");
        assert!(f.matches("Basic.TC_OPEN_CLEAN_phase_1"));
        assert!(f.matches("MoveCleanPool.X"));
        assert!(!f.matches("Basic.TC_OPEN_DIRTY_NO_US_phase_1"));
        assert!(!f.matches("SyncLocalReplica.X"));
    }

    #[test]
    fn filter_only_negative() {
        let f = TestFilter::parse("-*phase_3*");
        assert!(f.matches("A.B_phase_1"));
        assert!(!f.matches("A.B_phase_3"));
    }

    #[test]
    fn restrict_to_phase() {
        let p2 = Phase::new(2).unwrap();
        assert_eq!(phase_filter("*", p2), "**phase_2*");
        assert_eq!(phase_filter("", p2), "*phase_2*");
        assert_eq!(phase_filter("A.*:B.*", p2), "A.**phase_2*:B.**phase_2*");
        assert_eq!(phase_filter("A.*-*X*", p2), "A.**phase_2*-*X*");

        let f = TestFilter::parse(&phase_filter("*TRY_OPEN*", p2));
        assert!(f.matches("UnsafeShutdownBasic.TRY_OPEN_OBJ_phase_2"));
        assert!(!f.matches("UnsafeShutdownBasic.TRY_OPEN_OBJ_phase_1"));
        let f = TestFilter::parse(&phase_filter("*", p2));
        assert!(f.matches("UnsafeShutdown/SyncLocalReplica.TC_phase_2/4"));
    }

    #[test]
    fn longer_phase_number_is_another_phase() {
        let p1 = Phase::new(1).unwrap();
        assert_eq!(phase_filter("A.B_phase_12", p1), "A.B_phase_12*phase_1*");
        assert_eq!(phase_filter("A.B_phase_1", p1), "A.B_phase_1");
        assert_eq!(phase_filter("A.B_phase_1/3", p1), "A.B_phase_1/3");
        assert_eq!(
            phase_filter("*phase_10*:*phase_1*", p1),
            "*phase_10**phase_1*:*phase_1*"
        );

        let f = TestFilter::parse(&phase_filter("*_phase_12", p1));
        assert!(!f.matches("Suite.Case_phase_12"));
        assert!(!f.matches("Suite.Case_phase_1"));
    }

    #[proptest]
    fn phase_filter_is_idempotent(
        #[strategy("[A-Za-z.*:_-]{0,16}")] filter: String,
        #[strategy(1u32..5)] n: u32,
    ) {
        let phase = Phase::new(n).unwrap();
        let once = phase_filter(&filter, phase);
        assert_eq!(phase_filter(&once, phase), once);
    }

    #[proptest]
    fn star_matches_everything(#[strategy("[a-z_./]{0,24}")] name: String) {
        assert!(glob_match("*", &name));
        assert!(glob_match(&name, &name));
    }
}

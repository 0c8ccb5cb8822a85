//! User-defined alert rules over live sensor values.
//!
//! The expression grammar is fixed and deliberately small:
//!
//! ```text
//! expr       := term (('&&' | '||') term)*
//! term       := sensor-ref op literal
//! sensor-ref := 's' HEX{4}
//! op         := '<' | '>' | '<=' | '>=' | '==' | '!='
//! literal    := signed decimal number
//! ```
//!
//! Connectors evaluate left to right with equal precedence. A rule
//! fires once on each rising edge of its expression, and only after
//! every referenced sensor has reported at least one value.

use log::{debug, info};
use std::{
    collections::HashMap,
    io::{BufRead, Write},
    path::Path,
};

use crate::error::RuleError;
use crate::sensor::Pid;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Op {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Connector {
    And,
    Or,
}

#[derive(Clone, Copy, Debug)]
struct Term {
    pid: Pid,
    op: Op,
    literal: f64,
}

impl Term {
    fn eval(&self, values: &HashMap<Pid, f64>) -> Option<bool> {
        let v = *values.get(&self.pid)?;
        Some(match self.op {
            Op::Lt => v < self.literal,
            Op::Gt => v > self.literal,
            Op::Le => v <= self.literal,
            Op::Ge => v >= self.literal,
            Op::Eq => v == self.literal,
            Op::Ne => v != self.literal,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Token {
    Ref(Pid),
    Op(Op),
    Conn(Connector),
    Number(usize), // index into the lexer's literal table
}

fn tokenize(source: &str) -> Result<(Vec<Token>, Vec<f64>), RuleError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut literals = Vec::new();
    let mut i = 0;

    let fail = |i: usize, what: &str| {
        Err(RuleError::ParseFailed(format!(
            "{what} at position {i} in `{source}`"
        )))
    };

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b's' => {
                let Some(text) = source.get(i + 1..i + 5) else {
                    return fail(i, "truncated sensor reference");
                };
                let Some(pid) = Pid::parse(text) else {
                    return fail(i, "bad sensor reference");
                };
                tokens.push(Token::Ref(pid));
                i += 5;
            }
            b'&' => {
                if bytes.get(i + 1) != Some(&b'&') {
                    return fail(i, "expected `&&`");
                }
                tokens.push(Token::Conn(Connector::And));
                i += 2;
            }
            b'|' => {
                if bytes.get(i + 1) != Some(&b'|') {
                    return fail(i, "expected `||`");
                }
                tokens.push(Token::Conn(Connector::Or));
                i += 2;
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(Op::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Op::Lt));
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Op(Op::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Op::Gt));
                    i += 1;
                }
            }
            b'=' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return fail(i, "expected `==`");
                }
                tokens.push(Token::Op(Op::Eq));
                i += 2;
            }
            b'!' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return fail(i, "expected `!=`");
                }
                tokens.push(Token::Op(Op::Ne));
                i += 2;
            }
            b'0'..=b'9' | b'-' | b'+' | b'.' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let Ok(value) = source[start..i].parse::<f64>() else {
                    return fail(start, "bad number");
                };
                literals.push(value);
                tokens.push(Token::Number(literals.len() - 1));
            }
            other => {
                return fail(i, &format!("unexpected character `{}`", other as char));
            }
        }
    }

    Ok((tokens, literals))
}

fn parse_expression(source: &str) -> Result<(Vec<Term>, Vec<Connector>), RuleError> {
    let (tokens, literals) = tokenize(source)?;

    let mut terms = Vec::new();
    let mut connectors = Vec::new();
    let mut iter = tokens.iter();

    let term = |iter: &mut std::slice::Iter<Token>| -> Result<Term, RuleError> {
        let Some(Token::Ref(pid)) = iter.next() else {
            return Err(RuleError::ParseFailed(format!(
                "expected a sensor reference in `{source}`"
            )));
        };
        let Some(Token::Op(op)) = iter.next() else {
            return Err(RuleError::ParseFailed(format!(
                "expected a comparison operator in `{source}`"
            )));
        };
        let Some(Token::Number(idx)) = iter.next() else {
            return Err(RuleError::ParseFailed(format!(
                "expected a number in `{source}`"
            )));
        };
        Ok(Term {
            pid: *pid,
            op: *op,
            literal: literals[*idx],
        })
    };

    terms.push(term(&mut iter)?);
    loop {
        match iter.next() {
            None => break,
            Some(Token::Conn(conn)) => {
                connectors.push(*conn);
                terms.push(term(&mut iter)?);
            }
            Some(_) => {
                return Err(RuleError::ParseFailed(format!(
                    "expected `&&` or `||` in `{source}`"
                )));
            }
        }
    }

    Ok((terms, connectors))
}

/// A parsed rule with its evaluation state.
pub struct Rule {
    name: String,
    source: String,
    terms: Vec<Term>,
    connectors: Vec<Connector>,
    refs: Vec<Pid>,
    values: HashMap<Pid, f64>,
    satisfied: bool,
    active: bool,
}

impl Rule {
    /// Parse `source` against the grammar. `name` is the human-readable
    /// identity used in alerts.
    pub fn parse(name: impl Into<String>, source: impl Into<String>) -> Result<Self, RuleError> {
        let source = source.into();
        let (terms, connectors) = parse_expression(&source)?;

        let mut refs = Vec::new();
        for term in &terms {
            if !refs.contains(&term.pid) {
                refs.push(term.pid);
            }
        }

        Ok(Rule {
            name: name.into(),
            source,
            terms,
            connectors,
            refs,
            values: HashMap::new(),
            satisfied: false,
            active: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The distinct PIDs this rule references, in order of appearance.
    pub fn refs(&self) -> &[Pid] {
        &self.refs
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    /// Start listening. Every referenced sensor must be in the active
    /// set, otherwise the rule could never complete a round of updates.
    pub(crate) fn activate(&mut self, active_pids: &[Pid]) -> Result<(), RuleError> {
        for pid in &self.refs {
            if !active_pids.contains(pid) {
                return Err(RuleError::MissingSensor(*pid));
            }
        }
        self.values.clear();
        self.satisfied = false;
        self.active = true;
        debug!("rule `{}` activated", self.name);
        Ok(())
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.values.clear();
        self.satisfied = false;
        debug!("rule `{}` deactivated", self.name);
    }

    /// Fold the expression left to right. `None` until every referenced
    /// sensor has a value.
    fn eval(&self) -> Option<bool> {
        let mut terms = self.terms.iter();
        let mut acc = terms.next()?.eval(&self.values)?;
        for (conn, term) in self.connectors.iter().zip(terms) {
            let rhs = term.eval(&self.values)?;
            acc = match conn {
                Connector::And => acc && rhs,
                Connector::Or => acc || rhs,
            };
        }
        Some(acc)
    }

    /// Feed one sensor update. Returns true when this update produced a
    /// rising edge and the alert should fire.
    pub(crate) fn on_value(&mut self, pid: Pid, value: f64) -> bool {
        if !self.active || !self.refs.contains(&pid) {
            return false;
        }
        self.values.insert(pid, value);

        let Some(result) = self.eval() else {
            // some referenced sensor has not reported yet
            return false;
        };

        if result && !self.satisfied {
            self.satisfied = true;
            info!("rule `{}` satisfied", self.name);
            return true;
        }
        if !result {
            self.satisfied = false;
        }
        false
    }
}

/// Replace sensor references with their human names and connectors with
/// words. A pure string transform, never evaluated.
pub fn render_english(source: &str, name_of: impl Fn(Pid) -> Option<&'static str>) -> String {
    let bytes = source.as_bytes();
    let mut out = String::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b's' {
            if let Some(pid) = source.get(i + 1..i + 5).and_then(Pid::parse) {
                match name_of(pid) {
                    Some(name) => out.push_str(name),
                    None => out.push_str(&format!("UNKNOWN SENSOR: {pid}")),
                }
                i += 5;
                continue;
            }
        }
        if bytes[i] == b'&' && bytes.get(i + 1) == Some(&b'&') {
            out.push_str("AND");
            i += 2;
            continue;
        }
        if bytes[i] == b'|' && bytes.get(i + 1) == Some(&b'|') {
            out.push_str("OR");
            i += 2;
            continue;
        }
        out.push(bytes[i] as char);
        i += 1;
    }

    out
}

/// The set of rules the kernel knows about.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        RuleEngine::default()
    }

    /// Register a rule. Duplicate sources are refused silently, matching
    /// how the rule file behaves.
    pub(crate) fn add(&mut self, rule: Rule) -> bool {
        if self.rules.iter().any(|r| r.source() == rule.source()) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    /// Drop a rule by its source text or rendered name.
    pub(crate) fn remove(&mut self, source_or_name: &str) -> Option<Rule> {
        let idx = self
            .rules
            .iter()
            .position(|r| r.source() == source_or_name || r.name() == source_or_name)?;
        Some(self.rules.remove(idx))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The source text of every registered rule, in order.
    pub fn sources(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.source().to_owned()).collect()
    }

    /// Feed one sensor update to every active rule; returns the names of
    /// rules whose alerts should fire, in registration order.
    pub(crate) fn on_value(&mut self, pid: Pid, value: f64) -> Vec<String> {
        let mut names = Vec::new();
        for r in self.rules.iter_mut() {
            if r.on_value(pid, value) {
                names.push(r.name().to_owned());
            }
        }
        names
    }

    /// Deactivate every rule, e.g. when the session ends.
    pub(crate) fn deactivate_all(&mut self) {
        for rule in &mut self.rules {
            if rule.is_active() {
                rule.deactivate();
            }
        }
    }

    /// A sensor left the active set: every rule referencing it can no
    /// longer complete, so those rules deactivate. Returns their names.
    pub(crate) fn on_sensor_deactivated(&mut self, pid: Pid) -> Vec<String> {
        let mut dropped = Vec::new();
        for rule in &mut self.rules {
            if rule.is_active() && rule.refs().contains(&pid) {
                rule.deactivate();
                dropped.push(rule.name().to_owned());
            }
        }
        dropped
    }
}

/// Read rule sources from a file: one expression per line, blank lines
/// ignored.
pub fn load_rule_file(path: &Path) -> std::io::Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut sources = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            sources.push(line.to_owned());
        }
    }
    Ok(sources)
}

/// Rewrite the whole rule file from the given sources.
pub fn save_rule_file(path: &Path, sources: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for source in sources {
        writeln!(file, "{source}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(text: &str) -> Pid {
        Pid::parse(text).unwrap()
    }

    #[test]
    fn parses_single_term() {
        let rule = Rule::parse("r", "s010C > 3000").unwrap();
        assert_eq!(rule.refs(), [pid("010C")]);
    }

    #[test]
    fn parses_compound_expression() {
        let rule = Rule::parse("r", "s010C > 3000 && s010D > 130 || s0105 <= -10.5").unwrap();
        assert_eq!(rule.refs(), [pid("010C"), pid("010D"), pid("0105")]);
    }

    #[test]
    fn duplicate_refs_collapse() {
        let rule = Rule::parse("r", "s010C > 1000 && s010C < 5000").unwrap();
        assert_eq!(rule.refs(), [pid("010C")]);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "s010C",
            "s010C >",
            "s010C > abc",
            "s010C = 10",
            "s010C > 10 &&",
            "s010C > 10 s010D > 20",
            "s01 > 10",
            "(s010C > 10)",
            "s010C > 10 & s010D > 20",
        ] {
            assert!(
                matches!(Rule::parse("r", bad), Err(RuleError::ParseFailed(_))),
                "`{bad}` should not parse"
            );
        }
    }

    #[test]
    fn activation_requires_referenced_sensors() {
        let mut rule = Rule::parse("r", "s010C > 3000 && s010D > 130").unwrap();
        let err = rule.activate(&[pid("010C")]).unwrap_err();
        assert!(matches!(err, RuleError::MissingSensor(p) if p == pid("010D")));
        rule.activate(&[pid("010C"), pid("010D")]).unwrap();
        assert!(rule.is_active());
    }

    #[test]
    fn waits_for_all_sensors_before_evaluating() {
        let mut rule = Rule::parse("r", "s010C > 3000 && s010D > 130").unwrap();
        rule.activate(&[pid("010C"), pid("010D")]).unwrap();

        assert!(!rule.on_value(pid("010C"), 3200.0));
        // both sensors have now reported, expression is true
        assert!(rule.on_value(pid("010D"), 140.0));
    }

    #[test]
    fn rising_edge_fires_exactly_once() {
        let mut rule = Rule::parse("r", "s010C > 3000 && s010D > 130").unwrap();
        rule.activate(&[pid("010C"), pid("010D")]).unwrap();

        rule.on_value(pid("010C"), 3200.0);
        assert!(rule.on_value(pid("010D"), 140.0));

        // identical updates keep it satisfied but silent
        assert!(!rule.on_value(pid("010C"), 3200.0));
        assert!(!rule.on_value(pid("010D"), 140.0));

        // falling edge clears silently
        assert!(!rule.on_value(pid("010D"), 120.0));
        assert!(!rule.is_satisfied());

        // and the next rise fires again
        assert!(!rule.on_value(pid("010D"), 120.0));
        assert!(rule.on_value(pid("010D"), 140.0));
    }

    #[test]
    fn connectors_fold_left_to_right() {
        // with equal precedence, `a || b && c` is `(a || b) && c`;
        // c is false here, so the whole expression must be false even
        // though `b && c` false would leave `a ||` true under the other
        // reading
        let mut rule =
            Rule::parse("r", "s0001 == 1 || s0002 == 1 && s0003 == 1").unwrap();
        rule.activate(&[pid("0001"), pid("0002"), pid("0003")]).unwrap();

        rule.on_value(pid("0001"), 1.0);
        rule.on_value(pid("0002"), 0.0);
        assert!(!rule.on_value(pid("0003"), 0.0));
        assert!(!rule.is_satisfied());

        // now make c true: (true || false) && true
        assert!(rule.on_value(pid("0003"), 1.0));
    }

    #[test]
    fn all_operators_evaluate() {
        for (source, value, expect) in [
            ("s010D < 100", 80.0, true),
            ("s010D > 100", 80.0, false),
            ("s010D <= 80", 80.0, true),
            ("s010D >= 81", 80.0, false),
            ("s010D == 80", 80.0, true),
            ("s010D != 80", 80.0, false),
            ("s010D > -10", 80.0, true),
        ] {
            let mut rule = Rule::parse("r", source).unwrap();
            rule.activate(&[pid("010D")]).unwrap();
            assert_eq!(
                rule.on_value(pid("010D"), value),
                expect,
                "`{source}` with {value}"
            );
        }
    }

    #[test]
    fn english_rendering() {
        let rendered = render_english("s010C > 3000 && s010D > 130", |p| {
            match p.param() {
                0x0C => Some("Engine RPM"),
                0x0D => Some("Vehicle speed"),
                _ => None,
            }
        });
        assert_eq!(rendered, "Engine RPM > 3000 AND Vehicle speed > 130");

        let rendered = render_english("s01FF < 1 || s010D > 2", |p| {
            (p.param() == 0x0D).then_some("Vehicle speed")
        });
        assert_eq!(rendered, "UNKNOWN SENSOR: 01FF < 1 OR Vehicle speed > 2");
    }

    #[test]
    fn engine_dedups_and_removes() {
        let mut engine = RuleEngine::new();
        assert!(engine.add(Rule::parse("a", "s010C > 1").unwrap()));
        assert!(!engine.add(Rule::parse("b", "s010C > 1").unwrap()));
        assert_eq!(engine.sources(), ["s010C > 1"]);

        assert!(engine.remove("s010C > 1").is_some());
        assert!(engine.remove("s010C > 1").is_none());
    }

    #[test]
    fn engine_auto_deactivates_on_sensor_loss() {
        let mut engine = RuleEngine::new();
        let mut rule = Rule::parse("watcher", "s010C > 1 && s010D > 1").unwrap();
        rule.activate(&[pid("010C"), pid("010D")]).unwrap();
        engine.add(rule);

        let dropped = engine.on_sensor_deactivated(pid("010D"));
        assert_eq!(dropped, ["watcher"]);
        assert!(!engine.rules()[0].is_active());
    }

    #[test]
    fn rule_file_round_trip() {
        let dir = std::env::temp_dir().join("obdmon-rule-file-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rules.txt");

        let sources = vec!["s010C > 3000 && s010D > 130".to_owned(), "s0105 > 100".to_owned()];
        save_rule_file(&path, &sources).unwrap();
        let loaded = load_rule_file(&path).unwrap();
        assert_eq!(loaded, sources);

        // rewriting shrinks the file
        save_rule_file(&path, &sources[..1].to_vec()).unwrap();
        assert_eq!(load_rule_file(&path).unwrap(), &sources[..1]);

        std::fs::remove_dir_all(&dir).ok();
    }
}

//! Backtracking pattern matcher behind the host `Regex` surface.
//!
//! Patterns are parsed with `regex-syntax` and compiled to a small split/jump program that is
//! run by a classic backtracking loop. Like the engines whose behavior the host imitates,
//! matching time can grow exponentially with the input, so every run observes an optional
//! deadline.

use std::time::Instant;

use regex_syntax::hir::{Class, Hir, HirKind, Look};
use regex_syntax::ParserBuilder;

const MAX_REPEAT: u32 = 1000;
const MAX_INSTS: usize = 64 * 1024;
const CLOCK_STRIDE: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    Syntax(String),
    Unsupported(&'static str),
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternError::Syntax(msg) => write!(f, "invalid pattern: {msg}"),
            PatternError::Unsupported(what) => write!(f, "unsupported pattern feature: {what}"),
        }
    }
}

/// Deadline passed while matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;

#[derive(Debug, Clone)]
enum Inst {
    Char(char),
    Ranges(Vec<(char, char)>),
    Look(Look),
    /// Try the first target, backtrack into the second.
    Split(usize, usize),
    Jmp(usize),
    /// Record the loop-entry position of an unbounded repetition.
    Mark(usize),
    /// Fail unless the loop body consumed input since its `Mark`.
    Progress(usize),
    Match,
}

#[derive(Debug)]
pub struct Pattern {
    source: String,
    insts: Vec<Inst>,
    marks: usize,
}

struct Compiler {
    insts: Vec<Inst>,
    marks: usize,
}

impl Compiler {
    fn emit(&mut self, inst: Inst) -> Result<usize, PatternError> {
        if self.insts.len() >= MAX_INSTS {
            return Err(PatternError::Unsupported("pattern too large"));
        }
        self.insts.push(inst);
        Ok(self.insts.len() - 1)
    }

    fn compile(&mut self, hir: &Hir) -> Result<(), PatternError> {
        match hir.kind() {
            HirKind::Empty => {}
            HirKind::Literal(lit) => {
                let text = std::str::from_utf8(&lit.0)
                    .map_err(|_| PatternError::Unsupported("non-UTF-8 literal"))?;
                for c in text.chars() {
                    self.emit(Inst::Char(c))?;
                }
            }
            HirKind::Class(Class::Unicode(cls)) => {
                let ranges = cls.ranges().iter().map(|r| (r.start(), r.end())).collect();
                self.emit(Inst::Ranges(ranges))?;
            }
            HirKind::Class(Class::Bytes(cls)) => {
                let ranges = cls
                    .ranges()
                    .iter()
                    .map(|r| (char::from(r.start()), char::from(r.end())))
                    .collect();
                self.emit(Inst::Ranges(ranges))?;
            }
            HirKind::Look(look) => match look {
                Look::Start
                | Look::End
                | Look::StartLF
                | Look::EndLF
                | Look::StartCRLF
                | Look::EndCRLF
                | Look::WordAscii
                | Look::WordAsciiNegate
                | Look::WordUnicode
                | Look::WordUnicodeNegate => {
                    self.emit(Inst::Look(*look))?;
                }
                _ => return Err(PatternError::Unsupported("assertion")),
            },
            HirKind::Capture(cap) => self.compile(&cap.sub)?,
            HirKind::Concat(subs) => {
                for sub in subs {
                    self.compile(sub)?;
                }
            }
            HirKind::Alternation(subs) => {
                let mut exits = Vec::new();
                for (i, sub) in subs.iter().enumerate() {
                    if i + 1 == subs.len() {
                        self.compile(sub)?;
                        break;
                    }
                    let split = self.emit(Inst::Split(0, 0))?;
                    self.compile(sub)?;
                    exits.push(self.emit(Inst::Jmp(0))?);
                    let next = self.insts.len();
                    self.insts[split] = Inst::Split(split + 1, next);
                }
                let end = self.insts.len();
                for exit in exits {
                    self.insts[exit] = Inst::Jmp(end);
                }
            }
            HirKind::Repetition(rep) => {
                if rep.min > MAX_REPEAT || rep.max.is_some_and(|m| m > MAX_REPEAT) {
                    return Err(PatternError::Unsupported("repetition count"));
                }
                for _ in 0..rep.min {
                    self.compile(&rep.sub)?;
                }
                match rep.max {
                    None => self.star(&rep.sub, rep.greedy)?,
                    Some(max) => {
                        let mut holes = Vec::new();
                        for _ in rep.min..max {
                            holes.push(self.emit(Inst::Split(0, 0))?);
                            self.compile(&rep.sub)?;
                        }
                        let end = self.insts.len();
                        for hole in holes {
                            self.insts[hole] = if rep.greedy {
                                Inst::Split(hole + 1, end)
                            } else {
                                Inst::Split(end, hole + 1)
                            };
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn star(&mut self, sub: &Hir, greedy: bool) -> Result<(), PatternError> {
        let mark = self.marks;
        self.marks += 1;
        let split = self.emit(Inst::Split(0, 0))?;
        self.emit(Inst::Mark(mark))?;
        self.compile(sub)?;
        self.emit(Inst::Progress(mark))?;
        self.emit(Inst::Jmp(split))?;
        let end = self.insts.len();
        self.insts[split] = if greedy {
            Inst::Split(split + 1, end)
        } else {
            Inst::Split(end, split + 1)
        };
        Ok(())
    }
}

enum Frame {
    Try(usize, usize),
    Restore(usize, usize),
}

struct Clock {
    deadline: Option<Instant>,
    steps: u32,
}

impl Clock {
    fn tick(&mut self) -> Result<(), Timeout> {
        self.steps = self.steps.wrapping_add(1);
        if self.steps % CLOCK_STRIDE == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return Err(Timeout);
                }
            }
        }
        Ok(())
    }
}

fn is_word_ascii(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_word_unicode(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn look_holds(look: Look, text: &[char], pos: usize) -> bool {
    let before = pos.checked_sub(1).and_then(|i| text.get(i)).copied();
    let after = text.get(pos).copied();
    let word = |f: fn(char) -> bool| before.is_some_and(f) != after.is_some_and(f);
    match look {
        Look::Start => pos == 0,
        Look::End => pos == text.len(),
        Look::StartLF => before.map_or(true, |c| c == '\n'),
        Look::EndLF => after.map_or(true, |c| c == '\n'),
        Look::StartCRLF => before.map_or(true, |c| c == '\n' || c == '\r'),
        Look::EndCRLF => after.map_or(true, |c| c == '\n' || c == '\r'),
        Look::WordAscii => word(is_word_ascii),
        Look::WordAsciiNegate => !word(is_word_ascii),
        Look::WordUnicode => word(is_word_unicode),
        Look::WordUnicodeNegate => !word(is_word_unicode),
        _ => false,
    }
}

impl Pattern {
    pub fn compile(pattern: &str, ignore_case: bool) -> Result<Self, PatternError> {
        let hir = ParserBuilder::new()
            .case_insensitive(ignore_case)
            .build()
            .parse(pattern)
            .map_err(|e| PatternError::Syntax(e.to_string()))?;
        let mut compiler = Compiler {
            insts: Vec::new(),
            marks: 0,
        };
        compiler.compile(&hir)?;
        compiler.emit(Inst::Match)?;
        Ok(Self {
            source: pattern.to_string(),
            insts: compiler.insts,
            marks: compiler.marks,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// End of the highest-priority match starting exactly at `start`.
    fn run_at(&self, text: &[char], start: usize, clock: &mut Clock) -> Result<Option<usize>, Timeout> {
        let mut marks = vec![usize::MAX; self.marks];
        let mut stack = vec![Frame::Try(0, start)];
        while let Some(frame) = stack.pop() {
            let (mut pc, mut pos) = match frame {
                Frame::Restore(mark, old) => {
                    marks[mark] = old;
                    continue;
                }
                Frame::Try(pc, pos) => (pc, pos),
            };
            loop {
                clock.tick()?;
                match &self.insts[pc] {
                    Inst::Char(c) => {
                        if text.get(pos) != Some(c) {
                            break;
                        }
                        pc += 1;
                        pos += 1;
                    }
                    Inst::Ranges(ranges) => {
                        let Some(&c) = text.get(pos) else { break };
                        if !ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) {
                            break;
                        }
                        pc += 1;
                        pos += 1;
                    }
                    Inst::Look(look) => {
                        if !look_holds(*look, text, pos) {
                            break;
                        }
                        pc += 1;
                    }
                    Inst::Split(first, second) => {
                        stack.push(Frame::Try(*second, pos));
                        pc = *first;
                    }
                    Inst::Jmp(target) => pc = *target,
                    Inst::Mark(mark) => {
                        stack.push(Frame::Restore(*mark, marks[*mark]));
                        marks[*mark] = pos;
                        pc += 1;
                    }
                    Inst::Progress(mark) => {
                        if marks[*mark] == pos {
                            break;
                        }
                        pc += 1;
                    }
                    Inst::Match => return Ok(Some(pos)),
                }
            }
        }
        Ok(None)
    }

    fn find_from(&self, text: &[char], from: usize, clock: &mut Clock) -> Result<Option<(usize, usize)>, Timeout> {
        for start in from..=text.len() {
            if let Some(end) = self.run_at(text, start, clock)? {
                return Ok(Some((start, end)));
            }
        }
        Ok(None)
    }

    pub fn is_match(&self, text: &str, deadline: Option<Instant>) -> Result<bool, Timeout> {
        let chars: Vec<char> = text.chars().collect();
        let mut clock = Clock { deadline, steps: 0 };
        Ok(self.find_from(&chars, 0, &mut clock)?.is_some())
    }

    /// Replaces every non-overlapping match with `replacement` taken literally.
    pub fn replace_all(&self, text: &str, replacement: &str, deadline: Option<Instant>) -> Result<String, Timeout> {
        let chars: Vec<char> = text.chars().collect();
        let mut clock = Clock { deadline, steps: 0 };
        let mut out = String::with_capacity(text.len());
        let mut copied = 0;
        let mut from = 0;
        while from <= chars.len() {
            let Some((start, end)) = self.find_from(&chars, from, &mut clock)? else {
                break;
            };
            out.extend(&chars[copied..start]);
            out.push_str(replacement);
            if end == start {
                if let Some(&c) = chars.get(start) {
                    out.push(c);
                }
                copied = start + 1;
                from = start + 1;
            } else {
                copied = end;
                from = end;
            }
        }
        if copied < chars.len() {
            out.extend(&chars[copied..]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn matches(pattern: &str, text: &str) -> bool {
        Pattern::compile(pattern, false)
            .expect("compile")
            .is_match(text, None)
            .expect("no deadline")
    }

    #[test]
    fn basic_constructs() {
        assert!(matches("a+b", "xxaaab"));
        assert!(!matches("^a+b$", "xxaaab"));
        assert!(matches("^(cat|dog)s?$", "dogs"));
        assert!(matches("^[0-9]{2,3}$", "123"));
        assert!(!matches("^[0-9]{2,3}$", "1234"));
        assert!(matches(r"\bword\b", "a word here"));
        assert!(!matches(r"\bword\b", "swordfish"));
        assert!(matches("^(a*)*$", "aaa"));
        assert!(matches("^$", ""));
    }

    #[test]
    fn case_insensitive_option() {
        let p = Pattern::compile("hello", true).expect("compile");
        assert_eq!(p.is_match("Say HELLO", None), Ok(true));
    }

    #[test]
    fn replace_handles_empty_matches() {
        let p = Pattern::compile("a*", false).expect("compile");
        assert_eq!(p.replace_all("baac", "-", None), Ok("-b--c-".to_string()));
        let p = Pattern::compile("o", false).expect("compile");
        assert_eq!(p.replace_all("foo", "0", None), Ok("f00".to_string()));
    }

    #[test]
    fn catastrophic_pattern_hits_deadline() {
        let p = Pattern::compile("^(a+)+$", false).expect("compile");
        let text = format!("{}!", "a".repeat(40));
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();
        assert_eq!(p.is_match(&text, Some(deadline)), Err(Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            Pattern::compile("(", false),
            Err(PatternError::Syntax(_))
        ));
    }
}

//! Pattern compiler - reduces mini-notation ASTs to value sequences
//!
//! Every evaluation walks the parsed tree and produces a flat ordered
//! sequence of values. "Flat" vectors (ramps, `!` expansions) splice into
//! the parent sequence; "column" vectors (`[a,b,c]`) stay nested so a
//! higher level can zip them against other parameters.
//!
//! All random draws (`r`, `|`, `:`, legacy `?`) pull from one PRNG stream
//! owned by the compiler. Seeding the compiler reproduces the exact output
//! sequence; fresh compilers differ.

use crate::error::ParseError;
use crate::mini_notation::{parse_pattern, AstNode, BinOp, NoteLiteral};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;

lazy_static! {
    /// Semitone base for each note letter within one octave.
    static ref NOTE_BASE: HashMap<char, i32> = {
        let mut m = HashMap::new();
        m.insert('c', 0);
        m.insert('d', 2);
        m.insert('e', 4);
        m.insert('f', 5);
        m.insert('g', 7);
        m.insert('a', 9);
        m.insert('b', 11);
        m
    };
}

/// Octave used when a note literal carries none. `c` alone resolves to 60.
const DEFAULT_OCTAVE: i32 = 5;

/// Resolve a note literal to its MIDI-style pitch number.
pub fn resolve_note(note: &NoteLiteral) -> f64 {
    let base = NOTE_BASE.get(&note.letter).copied().unwrap_or(0);
    let octave = note.octave.unwrap_or(DEFAULT_OCTAVE);
    (12 * octave + base + note.accidental) as f64
}

/// A concrete pattern value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Name(String),
    /// A column vector: consumed whole by zip-style broadcasting downstream.
    Vector(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{}", n),
            Value::Name(s) => write!(f, "{}", s),
            Value::Vector(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Result of reducing one AST node. Flat vectors splice into the parent
/// sequence, column vectors stay nested.
#[derive(Debug, Clone, PartialEq)]
enum Reduced {
    Scalar(Value),
    Flat(Vec<Value>),
    Column(Vec<Value>),
}

impl Reduced {
    fn into_values(self, out: &mut Vec<Value>) {
        match self {
            Reduced::Scalar(v) => out.push(v),
            Reduced::Flat(vs) => out.extend(vs),
            Reduced::Column(vs) => out.push(Value::Vector(vs)),
        }
    }
}

/// Compiles mini-notation sources against one PRNG stream.
pub struct PatternCompiler {
    rng: fastrand::Rng,
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternCompiler {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// Deterministic compiler: a fixed seed reproduces a fixed sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Compile a pattern source into its ordered value sequence.
    pub fn compile(&mut self, source: &str) -> Result<Vec<Value>, ParseError> {
        let ast = parse_pattern(source)?;
        let mut out = Vec::new();
        for node in ast {
            self.reduce(&node)?.into_values(&mut out);
        }
        Ok(out)
    }

    /// Legacy token form: whitespace-split tokens with `?chance` and
    /// `!repeat` suffixes composing on a single token. `60!3?25` emits up
    /// to three copies of 60, each kept with 25% probability.
    pub fn compile_tokens(&mut self, source: &str) -> Result<Vec<Value>, ParseError> {
        if source.trim().is_empty() {
            return Err(ParseError::new("", "empty pattern"));
        }

        let mut out = Vec::new();
        for raw in source.split_whitespace() {
            let token = LegacyToken::split(raw)?;
            let values = self.compile(&token.base)?;
            for _ in 0..token.repeat {
                let keep = match token.chance {
                    Some(percent) => self.rng.f64() * 100.0 < percent,
                    None => true,
                };
                if keep {
                    out.extend(values.iter().cloned());
                }
            }
        }
        Ok(out)
    }

    fn reduce(&mut self, node: &AstNode) -> Result<Reduced, ParseError> {
        match node {
            AstNode::Number(n) => Ok(Reduced::Scalar(Value::Num(*n))),
            AstNode::Note(note) => Ok(Reduced::Scalar(Value::Num(resolve_note(note)))),
            AstNode::Name(name) => Ok(Reduced::Scalar(Value::Name(name.clone()))),
            AstNode::Random => Ok(Reduced::Scalar(Value::Num(self.rng.f64()))),
            AstNode::Ramp(a, b) => {
                let values: Vec<Value> = if a <= b {
                    (*a..=*b).map(|i| Value::Num(i as f64)).collect()
                } else {
                    (*b..=*a).rev().map(|i| Value::Num(i as f64)).collect()
                };
                Ok(Reduced::Flat(values))
            }
            AstNode::Vector(elements) => {
                let mut values = Vec::new();
                for element in elements {
                    self.reduce(element)?.into_values(&mut values);
                }
                Ok(Reduced::Column(values))
            }
            AstNode::Neg(inner) => {
                let reduced = self.reduce(inner)?;
                negate(reduced)
            }
            AstNode::Binary { op, lhs, rhs } => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                    let left = self.reduce(lhs)?;
                    let right = self.reduce(rhs)?;
                    arith(*op, left, right)
                }
                BinOp::Repeat => {
                    let count = self.reduce(rhs)?;
                    self.repeat(lhs, count)
                }
                BinOp::Range => {
                    let left = self.reduce(lhs)?;
                    let right = self.reduce(rhs)?;
                    self.range(left, right)
                }
                BinOp::Choice => {
                    // One draw decides the branch; only that branch is
                    // evaluated, so its own draws stay in stream order.
                    if self.rng.bool() {
                        self.reduce(lhs)
                    } else {
                        self.reduce(rhs)
                    }
                }
            },
        }
    }

    /// `x!n` re-evaluates `x` once per copy, so `r!3` is three independent
    /// draws. A scalar extends to n spliced copies; a vector extends to n
    /// concatenated repetitions of its elements, never element-wise.
    fn repeat(&mut self, lhs: &AstNode, count: Reduced) -> Result<Reduced, ParseError> {
        let n = scalar_num(&count, "repeat count")?;
        if n.fract() != 0.0 || n < 0.0 {
            return Err(ParseError::new(
                n.to_string(),
                "repeat count must be a non-negative integer",
            ));
        }
        let n = n as usize;

        let mut out = Vec::new();
        let mut column = false;
        for _ in 0..n {
            match self.reduce(lhs)? {
                Reduced::Scalar(v) => out.push(v),
                Reduced::Flat(vs) => out.extend(vs),
                Reduced::Column(vs) => {
                    column = true;
                    out.extend(vs);
                }
            }
        }
        Ok(if column {
            Reduced::Column(out)
        } else {
            Reduced::Flat(out)
        })
    }

    /// `a:b` draws one value uniformly. Integral iff the left operand is.
    fn range(&mut self, left: Reduced, right: Reduced) -> Result<Reduced, ParseError> {
        let a = scalar_num(&left, "left side of ':'")?;
        let b = scalar_num(&right, "right side of ':'")?;
        if a == b {
            return Ok(Reduced::Scalar(Value::Num(a)));
        }

        let lo = a.min(b);
        let hi = a.max(b);
        let drawn = if a.fract() == 0.0 {
            let lo_i = lo as i64;
            let hi_i = hi as i64;
            if hi_i <= lo_i {
                lo_i as f64
            } else {
                self.rng.i64(lo_i..hi_i) as f64
            }
        } else {
            lo + self.rng.f64() * (hi - lo)
        };
        Ok(Reduced::Scalar(Value::Num(drawn)))
    }
}

/// One-shot convenience compile with a fresh PRNG stream.
pub fn compile_pattern(source: &str) -> Result<Vec<Value>, ParseError> {
    PatternCompiler::new().compile(source)
}

/// A legacy token split into base text and its suffixes.
struct LegacyToken {
    base: String,
    repeat: u32,
    chance: Option<f64>,
}

impl LegacyToken {
    fn split(raw: &str) -> Result<Self, ParseError> {
        let cut = raw
            .char_indices()
            .find(|(_, ch)| *ch == '?' || *ch == '!')
            .map(|(i, _)| i)
            .unwrap_or(raw.len());
        let base = &raw[..cut];
        if base.is_empty() {
            return Err(ParseError::new(raw, "suffix without a token"));
        }

        let mut repeat = 1u32;
        let mut chance = None;
        let mut rest = raw[cut..].chars().peekable();
        while let Some(marker) = rest.next() {
            let mut digits = String::new();
            while let Some(ch) = rest.peek() {
                if ch.is_ascii_digit() || *ch == '.' {
                    digits.push(*ch);
                    rest.next();
                } else {
                    break;
                }
            }
            match marker {
                '?' => {
                    chance = if digits.is_empty() {
                        Some(50.0)
                    } else {
                        Some(digits.parse().map_err(|_| {
                            ParseError::new(raw, "malformed chance suffix")
                        })?)
                    };
                }
                '!' => {
                    if digits.is_empty() {
                        return Err(ParseError::new(raw, "repeat suffix needs a count"));
                    }
                    repeat = digits
                        .parse()
                        .map_err(|_| ParseError::new(raw, "malformed repeat suffix"))?;
                }
                _ => return Err(ParseError::new(raw, "malformed token suffix")),
            }
        }

        Ok(Self {
            base: base.to_string(),
            repeat,
            chance,
        })
    }
}

fn scalar_num(reduced: &Reduced, what: &str) -> Result<f64, ParseError> {
    match reduced {
        Reduced::Scalar(Value::Num(n)) => Ok(*n),
        other => Err(ParseError::new(
            format!("{:?}", other),
            format!("{} must be a number", what),
        )),
    }
}

fn negate(reduced: Reduced) -> Result<Reduced, ParseError> {
    fn neg_value(v: Value) -> Result<Value, ParseError> {
        match v {
            Value::Num(n) => Ok(Value::Num(-n)),
            Value::Name(name) => Err(ParseError::new(name, "cannot negate a name")),
            Value::Vector(vs) => Ok(Value::Vector(
                vs.into_iter().map(neg_value).collect::<Result<_, _>>()?,
            )),
        }
    }
    Ok(match reduced {
        Reduced::Scalar(v) => Reduced::Scalar(neg_value(v)?),
        Reduced::Flat(vs) => {
            Reduced::Flat(vs.into_iter().map(neg_value).collect::<Result<_, _>>()?)
        }
        Reduced::Column(vs) => {
            Reduced::Column(vs.into_iter().map(neg_value).collect::<Result<_, _>>()?)
        }
    })
}

/// Scalar arithmetic on two values, recursing into nested vectors.
fn value_op(op: BinOp, a: &Value, b: &Value) -> Result<Value, ParseError> {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => {
            let result = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => {
                    if *y == 0.0 {
                        return Err(ParseError::new(
                            format!("{}/{}", x, y),
                            "division by zero",
                        ));
                    }
                    x / y
                }
                _ => unreachable!("value_op only handles arithmetic"),
            };
            Ok(Value::Num(result))
        }
        (Value::Vector(_), _) | (_, Value::Vector(_)) => {
            let xs = as_slice(a);
            let ys = as_slice(b);
            let values = cycle_zip(op, xs, ys)?;
            Ok(Value::Vector(values))
        }
        (Value::Name(name), _) | (_, Value::Name(name)) => Err(ParseError::new(
            name.clone(),
            "cannot apply arithmetic to a name",
        )),
    }
}

fn as_slice(v: &Value) -> std::slice::Iter<'_, Value> {
    match v {
        Value::Vector(vs) => vs.iter(),
        _ => std::slice::from_ref(v).iter(),
    }
}

/// Element-wise combine, cycling the shorter operand. Lengths are
/// compatible when one divides the other; anything else is reported, not
/// truncated.
fn cycle_zip(
    op: BinOp,
    xs: std::slice::Iter<'_, Value>,
    ys: std::slice::Iter<'_, Value>,
) -> Result<Vec<Value>, ParseError> {
    let xs: Vec<&Value> = xs.collect();
    let ys: Vec<&Value> = ys.collect();
    let (la, lb) = (xs.len(), ys.len());
    if la == 0 || lb == 0 {
        return Ok(Vec::new());
    }
    let longer = la.max(lb);
    let shorter = la.min(lb).max(1);
    if longer % shorter != 0 {
        return Err(ParseError::new(
            format!("[{}]<op>[{}]", la, lb),
            format!("mismatched vector lengths {} and {}", la, lb),
        ));
    }

    let mut out = Vec::with_capacity(longer);
    for i in 0..longer {
        out.push(value_op(op, xs[i % la], ys[i % lb])?);
    }
    Ok(out)
}

fn arith(op: BinOp, lhs: Reduced, rhs: Reduced) -> Result<Reduced, ParseError> {
    match (&lhs, &rhs) {
        (Reduced::Scalar(a), Reduced::Scalar(b)) => Ok(Reduced::Scalar(value_op(op, a, b)?)),
        _ => {
            let column = matches!(lhs, Reduced::Column(_)) || matches!(rhs, Reduced::Column(_));
            let xs = reduced_values(&lhs);
            let ys = reduced_values(&rhs);
            let values = cycle_zip(op, xs.iter(), ys.iter())?;
            Ok(if column {
                Reduced::Column(values)
            } else {
                Reduced::Flat(values)
            })
        }
    }
}

fn reduced_values(r: &Reduced) -> Vec<Value> {
    match r {
        Reduced::Scalar(v) => vec![v.clone()],
        Reduced::Flat(vs) | Reduced::Column(vs) => vs.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nums(values: &[Value]) -> Vec<f64> {
        values.iter().map(|v| v.as_f64().unwrap()).collect()
    }

    #[test]
    fn test_arithmetic() {
        let mut c = PatternCompiler::new();
        assert_eq!(c.compile("2*2+4").unwrap(), vec![Value::Num(8.0)]);
        assert_eq!(c.compile("10-2/2").unwrap(), vec![Value::Num(9.0)]);
        assert_eq!(c.compile("(10-2)/2").unwrap(), vec![Value::Num(4.0)]);
        assert_eq!(c.compile("-3+1").unwrap(), vec![Value::Num(-2.0)]);
    }

    #[test]
    fn test_division_by_zero_reported() {
        let mut c = PatternCompiler::new();
        let err = c.compile("1/0").unwrap_err();
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn test_vector_elementwise() {
        let mut c = PatternCompiler::new();
        assert_eq!(
            c.compile("[2,2]+[2,2]").unwrap(),
            vec![Value::Vector(vec![Value::Num(4.0), Value::Num(4.0)])]
        );
        assert_eq!(
            c.compile("[1,2,3]*2").unwrap(),
            vec![Value::Vector(vec![
                Value::Num(2.0),
                Value::Num(4.0),
                Value::Num(6.0),
            ])]
        );
        // broadcast works in both directions
        assert_eq!(c.compile("2*[1,2]").unwrap(), c.compile("[1,2]*2").unwrap());
    }

    #[test]
    fn test_vector_cycles_shorter_operand() {
        let mut c = PatternCompiler::new();
        assert_eq!(
            c.compile("[1,2,3,4]+[10,20]").unwrap(),
            vec![Value::Vector(vec![
                Value::Num(11.0),
                Value::Num(22.0),
                Value::Num(13.0),
                Value::Num(24.0),
            ])]
        );
    }

    #[test]
    fn test_incompatible_vector_lengths_reported() {
        let mut c = PatternCompiler::new();
        let err = c.compile("[1,2,3]+[1,2]").unwrap_err();
        assert!(err.message.contains("mismatched vector lengths"));
    }

    #[test]
    fn test_note_names() {
        let mut c = PatternCompiler::new();
        assert_eq!(c.compile("c5").unwrap(), vec![Value::Num(60.0)]);
        assert_eq!(c.compile("c").unwrap(), vec![Value::Num(60.0)]);
        assert_eq!(c.compile("c#5").unwrap(), vec![Value::Num(61.0)]);
        assert_eq!(c.compile("eb5").unwrap(), vec![Value::Num(63.0)]);
        assert_eq!(c.compile("a4").unwrap(), vec![Value::Num(57.0)]);
        // note arithmetic transposes
        assert_eq!(c.compile("c5+12").unwrap(), vec![Value::Num(72.0)]);
    }

    #[test]
    fn test_bare_names_pass_through() {
        let mut c = PatternCompiler::new();
        assert_eq!(
            c.compile("bd sn").unwrap(),
            vec![Value::Name("bd".into()), Value::Name("sn".into())]
        );
        let err = c.compile("bd+1").unwrap_err();
        assert!(err.message.contains("arithmetic"));
    }

    #[test]
    fn test_ramp_splices_flat() {
        let mut c = PatternCompiler::new();
        assert_eq!(nums(&c.compile("0_3").unwrap()), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(nums(&c.compile("3_0").unwrap()), vec![3.0, 2.0, 1.0, 0.0]);
        // splices between neighbors
        assert_eq!(
            nums(&c.compile("9 0_2 9").unwrap()),
            vec![9.0, 0.0, 1.0, 2.0, 9.0]
        );
        // ramps stay flat under arithmetic
        assert_eq!(nums(&c.compile("0_2+10").unwrap()), vec![10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_repeat_extends() {
        let mut c = PatternCompiler::new();
        assert_eq!(nums(&c.compile("5!3").unwrap()), vec![5.0, 5.0, 5.0]);
        // vector repetition concatenates, it is not element-wise
        assert_eq!(
            c.compile("[1,2]!2").unwrap(),
            vec![Value::Vector(vec![
                Value::Num(1.0),
                Value::Num(2.0),
                Value::Num(1.0),
                Value::Num(2.0),
            ])]
        );
        assert_eq!(c.compile("5!0").unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_random_token_bounds() {
        let mut c = PatternCompiler::new();
        let values = c.compile("r!3").unwrap();
        assert_eq!(values.len(), 3);
        for v in &values {
            let n = v.as_f64().unwrap();
            assert!((0.0..1.0).contains(&n), "draw out of range: {}", n);
        }
    }

    #[test]
    fn test_repeat_of_random_draws_independently() {
        // r!3 re-evaluates per copy: three separate draws
        let a = PatternCompiler::with_seed(7).compile("r!3").unwrap();
        assert_eq!(a.len(), 3);
        assert!(a[0] != a[1] || a[1] != a[2]);
    }

    #[test]
    fn test_range_draw() {
        let mut c = PatternCompiler::new();
        assert_eq!(c.compile("1:1").unwrap(), vec![Value::Num(1.0)]);
        for _ in 0..100 {
            let v = c.compile("0:5").unwrap()[0].as_f64().unwrap();
            assert!((0.0..5.0).contains(&v));
            assert_eq!(v.fract(), 0.0, "integral left operand draws integers");
        }
        for _ in 0..100 {
            let v = c.compile("0.5:2").unwrap()[0].as_f64().unwrap();
            assert!((0.5..2.0).contains(&v));
        }
    }

    #[test]
    fn test_choice_picks_an_operand() {
        let mut c = PatternCompiler::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let v = c.compile("1|2").unwrap()[0].as_f64().unwrap();
            assert!(v == 1.0 || v == 2.0);
            seen.insert(v as i64);
        }
        assert_eq!(seen.len(), 2, "both operands should appear over 200 draws");

        // names flow through choice
        let v = &c.compile("bd|sn").unwrap()[0];
        assert!(matches!(v, Value::Name(n) if n == "bd" || n == "sn"));
    }

    #[test]
    fn test_seeded_compiles_reproduce() {
        let source = "r 0:9 1|2 r!2 0.1:4";
        let a = {
            let mut c = PatternCompiler::with_seed(42);
            (c.compile(source).unwrap(), c.compile(source).unwrap())
        };
        let b = {
            let mut c = PatternCompiler::with_seed(42);
            (c.compile(source).unwrap(), c.compile(source).unwrap())
        };
        assert_eq!(a, b);
        // distinct evaluations within one stream are expected to differ
        // (two draws of r in a row colliding is vanishingly unlikely)
        let mut c = PatternCompiler::with_seed(42);
        let first = c.compile("r").unwrap();
        let second = c.compile("r").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_legacy_repeat_suffix() {
        let mut c = PatternCompiler::new();
        assert_eq!(
            nums(&c.compile_tokens("60!3 62").unwrap()),
            vec![60.0, 60.0, 60.0, 62.0]
        );
    }

    #[test]
    fn test_legacy_chance_suffix() {
        // chance 100 always keeps, chance 0 always drops
        let mut c = PatternCompiler::new();
        assert_eq!(nums(&c.compile_tokens("60?100").unwrap()), vec![60.0]);
        assert_eq!(c.compile_tokens("60?0").unwrap(), Vec::<Value>::new());

        // bare '?' defaults to 50%: over many draws both outcomes appear
        let mut kept = 0;
        for _ in 0..200 {
            kept += c.compile_tokens("60?").unwrap().len();
        }
        assert!(kept > 0 && kept < 200);
    }

    #[test]
    fn test_legacy_suffixes_compose() {
        let mut c = PatternCompiler::new();
        let out = c.compile_tokens("60!4?100").unwrap();
        assert_eq!(nums(&out), vec![60.0, 60.0, 60.0, 60.0]);
        // each copy draws independently
        let mut c = PatternCompiler::with_seed(3);
        let out = c.compile_tokens("60!50?50").unwrap();
        assert!(!out.is_empty() && out.len() < 50);
    }

    #[test]
    fn test_legacy_malformed_suffix_reported() {
        let mut c = PatternCompiler::new();
        let err = c.compile_tokens("60!").unwrap_err();
        assert_eq!(err.offending, "60!");
        assert!(c.compile_tokens("?50").is_err());
    }

    #[test]
    fn test_malformed_input_never_silently_empty() {
        let mut c = PatternCompiler::new();
        assert!(c.compile("").is_err());
        assert!(c.compile("1+").is_err());
        assert!(c.compile("[1,2").is_err());
    }
}

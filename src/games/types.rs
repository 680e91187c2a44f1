use crate::errors::WagerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Stake, payout and balance amounts in minor units
pub type Amount = u64;

/// Game mode identifier ("30", "60", "aviator", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeId(String);

impl ModeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Round identifier, strictly increasing within a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodId(u64);

impl PeriodId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wager identifier, doubling as the client idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WagerId(String);

impl WagerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated bettor identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BettorId(String);

impl BettorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BettorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-point multiplier in basis points (10_000 = 1.00x)
///
/// Serialized as a decimal number so clients see `2.1` rather than `21000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiplier(u32);

impl Multiplier {
    pub const SCALE: u32 = 10_000;
    pub const ONE: Multiplier = Multiplier(Self::SCALE);

    pub const fn from_bp(bp: u32) -> Self {
        Self(bp)
    }

    pub fn from_f64(value: f64) -> Self {
        let bp = (value * Self::SCALE as f64).round();
        if bp <= 0.0 {
            Self(0)
        } else if bp >= u32::MAX as f64 {
            Self(u32::MAX)
        } else {
            Self(bp as u32)
        }
    }

    pub const fn bp(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn saturating_add(self, other: Multiplier) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Payout for `amount` at this multiplier, truncated to whole minor units
    pub fn apply(self, amount: Amount) -> Amount {
        let raw = amount as u128 * self.0 as u128 / Self::SCALE as u128;
        u64::try_from(raw).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}x", self.as_f64())
    }
}

impl Serialize for Multiplier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Multiplier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !value.is_finite() || value < 0.0 {
            return Err(serde::de::Error::custom(format!("invalid multiplier {}", value)));
        }
        Ok(Self::from_f64(value))
    }
}

const DIGITS: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

/// Result color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    Red,
    Green,
    Violet,
}

impl Color {
    /// 0 and 5 are violet; remaining evens red, odds green
    pub fn of(number: u8) -> Self {
        match number {
            0 | 5 => Color::Violet,
            n if n % 2 == 0 => Color::Red,
            _ => Color::Green,
        }
    }

    pub fn numbers(self) -> &'static [u8] {
        match self {
            Color::Red => &[2, 4, 6, 8],
            Color::Green => &[1, 3, 7, 9],
            Color::Violet => &[0, 5],
        }
    }
}

/// Result size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Size {
    Big,
    Small,
}

impl Size {
    pub fn of(number: u8) -> Self {
        if number >= 5 {
            Size::Big
        } else {
            Size::Small
        }
    }

    pub fn numbers(self) -> &'static [u8] {
        match self {
            Size::Big => &DIGITS[5..],
            Size::Small => &DIGITS[..5],
        }
    }
}

/// Payout class of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Number,
    Color,
    Size,
}

/// A bettable outcome: three colors, two sizes and ten exact numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Red,
    Green,
    Violet,
    Big,
    Small,
    Number(u8),
}

impl Bucket {
    pub const COUNT: usize = 15;

    pub const ALL: [Bucket; Self::COUNT] = [
        Bucket::Red,
        Bucket::Green,
        Bucket::Violet,
        Bucket::Big,
        Bucket::Small,
        Bucket::Number(0),
        Bucket::Number(1),
        Bucket::Number(2),
        Bucket::Number(3),
        Bucket::Number(4),
        Bucket::Number(5),
        Bucket::Number(6),
        Bucket::Number(7),
        Bucket::Number(8),
        Bucket::Number(9),
    ];

    /// Position in [`Bucket::ALL`]
    pub fn index(self) -> usize {
        match self {
            Bucket::Red => 0,
            Bucket::Green => 1,
            Bucket::Violet => 2,
            Bucket::Big => 3,
            Bucket::Small => 4,
            Bucket::Number(n) => 5 + (n.min(9) as usize),
        }
    }

    pub fn kind(self) -> BucketKind {
        match self {
            Bucket::Red | Bucket::Green | Bucket::Violet => BucketKind::Color,
            Bucket::Big | Bucket::Small => BucketKind::Size,
            Bucket::Number(_) => BucketKind::Number,
        }
    }

    /// Numbers that make this bucket win
    pub fn numbers(self) -> &'static [u8] {
        match self {
            Bucket::Red => Color::Red.numbers(),
            Bucket::Green => Color::Green.numbers(),
            Bucket::Violet => Color::Violet.numbers(),
            Bucket::Big => Size::Big.numbers(),
            Bucket::Small => Size::Small.numbers(),
            Bucket::Number(n) => {
                let n = n.min(9) as usize;
                &DIGITS[n..=n]
            }
        }
    }

    pub fn wins(self, result: &DrawResult) -> bool {
        match self {
            Bucket::Red => result.color() == Color::Red,
            Bucket::Green => result.color() == Color::Green,
            Bucket::Violet => result.color() == Color::Violet,
            Bucket::Big => result.size() == Size::Big,
            Bucket::Small => result.size() == Size::Small,
            Bucket::Number(n) => result.number() == n,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Red => f.write_str("Red"),
            Bucket::Green => f.write_str("Green"),
            Bucket::Violet => f.write_str("Violet"),
            Bucket::Big => f.write_str("Big"),
            Bucket::Small => f.write_str("Small"),
            Bucket::Number(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Bucket {
    type Err = WagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "red" => Ok(Bucket::Red),
            "green" => Ok(Bucket::Green),
            "violet" => Ok(Bucket::Violet),
            "big" => Ok(Bucket::Big),
            "small" => Ok(Bucket::Small),
            other => match other.parse::<u8>() {
                Ok(n) if n <= 9 => Ok(Bucket::Number(n)),
                _ => Err(WagerError::InvalidBucket(trimmed.to_string())),
            },
        }
    }
}

impl Serialize for Bucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bucket {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A drawn result. Color and size are always derived from the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "DrawWire")]
pub struct DrawResult {
    number: u8,
    color: Color,
    size: Size,
}

impl DrawResult {
    pub fn from_number(number: u8) -> Option<Self> {
        if number > 9 {
            return None;
        }
        Some(Self::from_digit(number))
    }

    /// Result for the last decimal digit of `number`
    pub(crate) fn from_digit(number: u8) -> Self {
        let number = number % 10;
        Self {
            number,
            color: Color::of(number),
            size: Size::of(number),
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn size(&self) -> Size {
        self.size
    }
}

impl fmt::Display for DrawResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.number, self.color, self.size)
    }
}

#[derive(Deserialize)]
struct DrawWire {
    number: u8,
}

impl TryFrom<DrawWire> for DrawResult {
    type Error = String;

    fn try_from(wire: DrawWire) -> Result<Self, Self::Error> {
        DrawResult::from_number(wire.number)
            .ok_or_else(|| format!("drawn number {} is outside 0-9", wire.number))
    }
}

/// How a discrete mode picks its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HouseStrategy {
    #[serde(alias = "low_bet")]
    Adversarial,
    UniformRandom,
    OperatorOverride,
}

impl fmt::Display for HouseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HouseStrategy::Adversarial => write!(f, "adversarial"),
            HouseStrategy::UniformRandom => write!(f, "uniform-random"),
            HouseStrategy::OperatorOverride => write!(f, "operator-override"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Discrete,
    Crash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Open,
    Closing,
    Drawn,
    Settled,
    /// Draw or settlement failed; listed for manual reconciliation
    Failed,
}

/// Where a drawn result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionSource {
    Adversarial,
    Uniform,
    Operator,
    Forced,
    Crash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    Pending,
    /// Won, but the credit has not been confirmed yet
    AwaitingCredit,
    Won,
    Lost,
    /// Round was never drawn; the stake went back to the bettor
    Refunded,
}

impl WagerStatus {
    pub fn is_final(self) -> bool {
        matches!(self, WagerStatus::Won | WagerStatus::Lost | WagerStatus::Refunded)
    }
}

impl fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WagerStatus::Pending => write!(f, "pending"),
            WagerStatus::AwaitingCredit => write!(f, "awaiting_credit"),
            WagerStatus::Won => write!(f, "won"),
            WagerStatus::Lost => write!(f, "lost"),
            WagerStatus::Refunded => write!(f, "refunded"),
        }
    }
}

/// What the wager is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WagerKind {
    Discrete { bucket: Bucket },
    Crash {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cashed_out_at: Option<Multiplier>,
    },
}

/// A single bet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    pub id: WagerId,
    pub mode: ModeId,
    pub period: PeriodId,
    pub bettor: BettorId,
    #[serde(flatten)]
    pub kind: WagerKind,
    pub amount: Amount,
    pub status: WagerStatus,
    pub payout: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DrawResult>,
    pub placed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl Wager {
    pub fn bucket(&self) -> Option<Bucket> {
        match self.kind {
            WagerKind::Discrete { bucket } => Some(bucket),
            WagerKind::Crash { .. } => None,
        }
    }

    pub fn cashed_out_at(&self) -> Option<Multiplier> {
        match self.kind {
            WagerKind::Crash { cashed_out_at } => cashed_out_at,
            WagerKind::Discrete { .. } => None,
        }
    }
}

/// Audit record of one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub mode: ModeId,
    pub period: PeriodId,
    pub status: RoundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DrawResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_point: Option<Multiplier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SelectionSource>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub total_staked: Amount,
    pub wager_count: u32,
}

/// One entry of a mode's result history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentResult {
    pub period: PeriodId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DrawResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_point: Option<Multiplier>,
}

impl From<&RoundRecord> for RecentResult {
    fn from(record: &RoundRecord) -> Self {
        Self {
            period: record.period,
            result: record.result,
            crash_point: record.crash_point,
        }
    }
}

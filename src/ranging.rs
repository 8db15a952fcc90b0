//! Current ranges and the automatic ranging heuristic.

use std::fmt;

/// Readings discarded after a range switch; the shunt relay leaves transient
/// artifacts in the next conversions.
pub const RANGE_SWITCH_SKIP_SAMPLES: u32 = 2;

/// Consecutive detections required before switching (counter must exceed this).
const SWITCH_DETECTIONS: u32 = 3;
/// Relative full-scale level above which a higher range is wanted.
const OVER_RANGE_LEVEL: f64 = 1.05;
/// Relative full-scale level below which a lower range is wanted.
const UNDER_RANGE_LEVEL: f64 = 0.0095;

/// One of the three decade current ranges, selected by shunt resistor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CurrentRange {
    /// 20 mA full scale (10 Ω shunt)
    #[default]
    High = 0,
    /// 200 µA full scale (1 kΩ shunt)
    Mid = 1,
    /// 2 µA full scale (100 kΩ shunt)
    Low = 2,
}

impl CurrentRange {
    pub const ALL: [CurrentRange; 3] = [CurrentRange::High, CurrentRange::Mid, CurrentRange::Low];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// `100^index`: the gain step between decades.
    pub fn decade_divisor(self) -> f64 {
        100f64.powi(self as i32)
    }

    /// Nominal full-scale current in mA.
    pub fn full_scale_ma(self) -> f64 {
        20.0 / self.decade_divisor()
    }

    /// Protocol command selecting this range.
    pub fn command(self) -> &'static str {
        match self {
            CurrentRange::High => "RANGE 1",
            CurrentRange::Mid => "RANGE 2",
            CurrentRange::Low => "RANGE 3",
        }
    }

    /// Next range towards higher current (lower index).
    pub fn higher(self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    /// Next range towards lower current (higher index).
    pub fn lower(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }
}

impl fmt::Display for CurrentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CurrentRange::High => "20 mA",
            CurrentRange::Mid => "200 µA",
            CurrentRange::Low => "2 µA",
        };
        f.write_str(label)
    }
}

/// Range that can carry `current_ma` when it is known a priori.
pub fn range_for_magnitude(current_ma: f64) -> CurrentRange {
    let current = current_ma.abs();
    if current <= 0.002 {
        CurrentRange::Low
    } else if current <= 0.2 {
        CurrentRange::Mid
    } else {
        CurrentRange::High
    }
}

/// Which ranges the user allows the auto-ranging to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeMask(pub [bool; 3]);

impl Default for RangeMask {
    fn default() -> Self {
        RangeMask([true; 3])
    }
}

impl RangeMask {
    pub fn is_enabled(&self, range: CurrentRange) -> bool {
        self.0[range.index()]
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|&e| e)
    }

    /// Closest enabled range to `desired`, preferring higher current ranges.
    ///
    /// Returns `desired` itself if nothing is enabled.
    pub fn nearest_enabled(&self, desired: CurrentRange) -> CurrentRange {
        let up = (0..=desired.index()).rev();
        let down = desired.index()..CurrentRange::ALL.len();
        up.chain(down)
            .filter_map(CurrentRange::from_index)
            .find(|r| self.is_enabled(*r))
            .unwrap_or(desired)
    }
}

/// Outcome of feeding one reading to the [`AutoRanger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDecision {
    Keep,
    /// Switch to the given range, then discard `skip` readings.
    Switch { range: CurrentRange, skip: u32 },
}

/// Hysteretic automatic current ranging with debounce counters.
#[derive(Debug, Clone, Default)]
pub struct AutoRanger {
    mask: RangeMask,
    overcounter: u32,
    undercounter: u32,
}

impl AutoRanger {
    pub fn new(mask: RangeMask) -> Self {
        Self {
            mask,
            overcounter: 0,
            undercounter: 0,
        }
    }

    pub fn mask(&self) -> RangeMask {
        self.mask
    }

    pub fn counters(&self) -> (u32, u32) {
        (self.overcounter, self.undercounter)
    }

    pub fn reset(&mut self) {
        self.overcounter = 0;
        self.undercounter = 0;
    }

    /// Feed the latest current reading taken on `range`.
    pub fn update(&mut self, current_ma: f64, range: CurrentRange) -> RangeDecision {
        let relative = (current_ma / range.full_scale_ma()).abs();

        let higher = range.higher().filter(|r| self.mask.is_enabled(*r));
        let lower = range.lower().filter(|r| self.mask.is_enabled(*r));

        match higher {
            Some(_) if relative > OVER_RANGE_LEVEL => self.overcounter += 1,
            _ => self.overcounter = 0,
        }
        match lower {
            Some(_) if relative < UNDER_RANGE_LEVEL => self.undercounter += 1,
            _ => self.undercounter = 0,
        }

        let target = if self.overcounter > SWITCH_DETECTIONS {
            higher
        } else if self.undercounter > SWITCH_DETECTIONS {
            lower
        } else {
            None
        };

        match target {
            Some(range) => {
                self.reset();
                RangeDecision::Switch {
                    range,
                    skip: RANGE_SWITCH_SKIP_SAMPLES,
                }
            }
            None => RangeDecision::Keep,
        }
    }
}

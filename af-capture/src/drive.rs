//! Guest drive letters for mounted shares.

use crate::error::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriveLetter(char);

impl DriveLetter {
    /// First drive tried for input shares.
    pub const I: DriveLetter = DriveLetter('I');
    /// Drive of the project output share.
    pub const O: DriveLetter = DriveLetter('O');

    pub fn new(letter: char) -> Result<Self> {
        let upper = letter.to_ascii_uppercase();
        if upper.is_ascii_uppercase() {
            Ok(Self(upper))
        } else {
            Err(CaptureError::InvalidInput(format!(
                "'{}' is not a drive letter",
                letter
            )))
        }
    }

    pub fn letter(&self) -> char {
        self.0
    }

    /// Form used on guest command lines, e.g. `I:`.
    pub fn drive_string(&self) -> String {
        format!("{}:", self.0)
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

/// Hands out free drive letters, optionally remembering them by key so inputs
/// on the same share land on the same drive.
#[derive(Debug)]
pub struct DriveLetters<K> {
    used: BTreeSet<DriveLetter>,
    by_key: HashMap<K, DriveLetter>,
}

impl<K: Eq + Hash> Default for DriveLetters<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> DriveLetters<K> {
    /// A..D are never handed out: floppies, system and optical drives.
    pub fn new() -> Self {
        let used = ['A', 'B', 'C', 'D']
            .into_iter()
            .map(DriveLetter)
            .collect::<BTreeSet<_>>();
        Self {
            used,
            by_key: HashMap::new(),
        }
    }

    /// Mark `letter` as taken. Returns false when it already was.
    pub fn reserve_letter(&mut self, letter: DriveLetter) -> bool {
        self.used.insert(letter)
    }

    /// Take `preferred` when free, else the lowest free letter.
    pub fn reserve(&mut self, preferred: DriveLetter) -> Result<DriveLetter> {
        if self.used.insert(preferred) {
            return Ok(preferred);
        }
        let letter = ('A'..='Z')
            .map(DriveLetter)
            .find(|l| !self.used.contains(l))
            .ok_or_else(|| CaptureError::InvalidInput("Out of drive letters".to_string()))?;
        self.used.insert(letter);
        Ok(letter)
    }

    /// The letter already given to `key`, or a newly reserved one.
    /// The second value tells whether the letter is new.
    pub fn reserve_with_key(&mut self, key: K, preferred: DriveLetter) -> Result<(DriveLetter, bool)> {
        if let Some(letter) = self.by_key.get(&key) {
            return Ok((*letter, false));
        }
        let letter = self.reserve(preferred)?;
        self.by_key.insert(key, letter);
        Ok((letter, true))
    }
}

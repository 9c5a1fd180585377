use serde::{Deserialize, Serialize};

/// The eight winning lines: rows, columns, diagonals.
pub const WIN_PATTERNS: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    X,
    O,
}

impl Mark {
    pub fn other(self) -> Self {
        match self {
            Self::X => Self::O,
            Self::O => Self::X,
        }
    }
}

impl std::fmt::Display for Mark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X => write!(f, "X"),
            Self::O => write!(f, "O"),
        }
    }
}

/// Rejections for a move attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    #[error("cell index out of bounds")]
    OutOfBounds,
    #[error("cell is already taken")]
    Occupied,
    #[error("not your turn")]
    NotYourTurn,
    #[error("game is not in progress")]
    NotPlaying,
    #[error("you are not a player in this room")]
    NotAPlayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outcome {
    Win { mark: Mark, line: [usize; 3] },
    Draw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board(pub [Option<Mark>; 9]);

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cells(&self) -> &[Option<Mark>; 9] {
        &self.0
    }

    pub fn place(&mut self, index: usize, mark: Mark) -> Result<(), MoveError> {
        let cell = self.0.get_mut(index).ok_or(MoveError::OutOfBounds)?;
        if cell.is_some() {
            return Err(MoveError::Occupied);
        }
        *cell = Some(mark);
        Ok(())
    }

    pub fn winner(&self) -> Option<(Mark, [usize; 3])> {
        WIN_PATTERNS.iter().find_map(|&line| {
            let [a, b, c] = line;
            match (self.0[a], self.0[b], self.0[c]) {
                (Some(m1), Some(m2), Some(m3)) if m1 == m2 && m2 == m3 => Some((m1, line)),
                _ => None,
            }
        })
    }

    pub fn is_full(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    pub fn move_count(&self) -> usize {
        self.0.iter().filter(|c| c.is_some()).count()
    }

    /// `None` while the game can still continue.
    pub fn outcome(&self) -> Option<Outcome> {
        if let Some((mark, line)) = self.winner() {
            return Some(Outcome::Win { mark, line });
        }
        self.is_full().then_some(Outcome::Draw)
    }
}

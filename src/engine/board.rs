//! Board generation: pure functions producing shuffled card boards.

use rand::{
    Rng, rng,
    seq::{IndexedRandom, SliceRandom},
};

use crate::{
    engine::room::{BOARD_SIZES, Card, PowerUpKind},
    error::{GameError, GameResult},
};

/// Generate a shuffled `size * size` board from a theme palette.
///
/// Picks `size²/2` distinct symbols, duplicates each into a pair, shuffles
/// the multiset, and assigns sequential ids post-shuffle. When
/// `power_up_chance > 0`, each card independently rolls one random catalogue
/// power-up with that probability.
pub fn generate_board(
    size: usize,
    palette: &[String],
    power_up_chance: f64,
) -> GameResult<Vec<Card>> {
    if !BOARD_SIZES.contains(&size) {
        return Err(GameError::Configuration(format!(
            "unsupported board size {size}"
        )));
    }

    let pairs = size * size / 2;
    if palette.len() < pairs {
        return Err(GameError::Configuration(format!(
            "theme palette has {} symbols but a {size}x{size} board needs {pairs}",
            palette.len()
        )));
    }

    let mut rng = rng();

    let mut symbols: Vec<&String> = palette.iter().collect();
    symbols.shuffle(&mut rng);
    symbols.truncate(pairs);

    let mut values: Vec<String> = symbols
        .into_iter()
        .flat_map(|symbol| [symbol.clone(), symbol.clone()])
        .collect();
    values.shuffle(&mut rng);

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(id, value)| Card {
            id,
            value,
            flipped: false,
            matched: false,
            power_up: (power_up_chance > 0.0 && rng.random_bool(power_up_chance))
                .then(|| *PowerUpKind::ALL.choose(&mut rng).unwrap_or(&PowerUpKind::Peek)),
        })
        .collect())
}

/// Degenerate two-card board for the sudden-death tie breaker: one random
/// symbol from the palette, shared by both cards, order randomized.
pub fn generate_sudden_death_cards(palette: &[String]) -> GameResult<Vec<Card>> {
    let value = palette
        .choose(&mut rng())
        .ok_or_else(|| GameError::Configuration("theme palette is empty".to_string()))?;

    Ok((0..2)
        .map(|id| Card {
            id,
            value: value.clone(),
            flipped: false,
            matched: false,
            power_up: None,
        })
        .collect())
}

//! Human-memorable session labels: `{adjective}-{noun}-{1000..9999}`.
//!
//! Labels are collision-tolerant, not collision-free: the caller retries
//! against the live-label unique index when an insert conflicts.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cool", "eager", "fair", "fancy", "fast", "gentle", "happy",
    "jolly", "kind", "keen", "lucky", "merry", "neat", "nice", "proud", "quick", "quiet",
    "rapid", "sharp", "shiny", "smart", "smooth", "snowy", "soft", "solid", "spicy", "sunny",
    "super", "sweet", "swift", "tall", "tidy", "tiny", "warm", "wild", "wise", "witty",
];

const NOUNS: &[&str] = &[
    "alpine", "anchor", "badger", "breeze", "brook", "canary", "canyon", "cedar", "cloud",
    "coral", "creek", "crystal", "dawn", "delta", "desert", "eagle", "ember", "falcon", "fern",
    "field", "finch", "flame", "forest", "frost", "garden", "glacier", "grove", "harbor",
    "hawk", "heron", "hill", "island", "jade", "jasper", "lake", "lantern", "lark", "leaf",
    "maple", "marsh", "meadow", "mesa", "mist", "moon", "moss", "oak", "ocean", "olive",
    "opal", "orchid", "otter", "owl", "palm", "panda", "pearl", "peak", "pebble", "pine",
    "pond", "prairie", "quartz", "rain", "raven", "reef", "river", "robin", "rock", "sage",
    "shore", "sky", "snow", "sparrow", "spring", "star", "stone", "storm", "stream", "summit",
    "sun", "swan", "thistle", "thunder", "tiger", "trail", "tree", "tulip", "valley", "violet",
    "wave", "willow", "wind", "wren", "zenith",
];

pub fn generate_label() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let num: u16 = rng.gen_range(1000..10000);
    format!("{adj}-{noun}-{num}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_has_the_documented_shape() {
        for _ in 0..200 {
            let label = generate_label();
            let parts: Vec<&str> = label.split('-').collect();
            assert_eq!(parts.len(), 3, "label {label}");
            assert!(parts[0].chars().all(|c| c.is_ascii_lowercase()));
            assert!(parts[1].chars().all(|c| c.is_ascii_lowercase()));
            let num: u16 = parts[2].parse().expect("numeric suffix");
            assert!((1000..=9999).contains(&num));
        }
    }
}

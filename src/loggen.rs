//! Random log line generator.
//!
//! Prints `[LEVEL] LOGGEN - <ip> - <text>` lines on a timer. No network.

use crate::config::LoggenConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

const LEVELS: [&str; 4] = ["INFO", "WARNING", "ERROR", "DEBUG"];

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789     ";

/// Builds log lines from its own random source.
pub struct LogGenerator {
    rng: StdRng,
    msg_length: usize,
}

impl LogGenerator {
    /// Same seed, same lines. `None` seeds from OS entropy.
    pub fn new(seed: Option<u64>, msg_length: usize) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, msg_length }
    }

    pub fn line(&mut self) -> String {
        let level = LEVELS[self.rng.gen_range(0..LEVELS.len())];
        let ip: [u8; 4] = self.rng.gen();
        let text: String = (0..self.msg_length)
            .map(|_| ALPHABET[self.rng.gen_range(0..ALPHABET.len())] as char)
            .collect();

        format!(
            "[{level}] LOGGEN - {}.{}.{}.{} - {text}",
            ip[0], ip[1], ip[2], ip[3]
        )
    }
}

/// Print `msg_count` lines every period, forever.
pub async fn run(config: LoggenConfig) {
    info!(
        "Log generator configured to print {} message(s) of length {} every {:?}",
        config.msg_count, config.msg_length, config.period
    );

    let mut generator = LogGenerator::new(config.seed, config.msg_length);
    let mut ticker = interval_at(Instant::now() + config.period, config.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        for _ in 0..config.msg_count {
            info!("{}", generator.line());
        }
    }
}

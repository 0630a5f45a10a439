use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use raster8::cli::{frame_sha1, init_logger};
use raster8::nes::state::SaveState;
use raster8::nes::{
    AutoPlayer, BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT,
    BUTTON_START, BUTTON_UP, Nes,
};

#[derive(Debug, Clone)]
struct Config {
    rom: Option<PathBuf>,
    frames: u32,
    hash_every: u32,
    autoplay_seed: Option<u32>,
    load_state: Option<PathBuf>,
    save_state: Option<PathBuf>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 600,
            hash_every: 0,
            autoplay_seed: None,
            load_state: None,
            save_state: None,
            verbose: false,
        }
    }
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom game.nes")?;
                cfg.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 600")?;
                cfg.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--hash-every" => {
                let value = args
                    .next()
                    .context("--hash-every requires an integer, e.g. --hash-every 60")?;
                cfg.hash_every = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --hash-every value: {value}"))?;
            }
            "--autoplay" => {
                let value = args
                    .next()
                    .context("--autoplay requires a seed, e.g. --autoplay 1234")?;
                let seed = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --autoplay seed: {value}"))?;
                // Xorshift never leaves zero.
                cfg.autoplay_seed = Some(seed.max(1));
            }
            "--load-state" => {
                let value = args
                    .next()
                    .context("--load-state requires a path, e.g. --load-state slot1.json")?;
                cfg.load_state = Some(PathBuf::from(value));
            }
            "--save-state" => {
                let value = args
                    .next()
                    .context("--save-state requires a path, e.g. --save-state slot1.json")?;
                cfg.save_state = Some(PathBuf::from(value));
            }
            "--verbose" | "-v" => cfg.verbose = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "raster8 headless runner\n\n\
Usage:\n\
  cargo run --release -- --rom <path> [options]\n\n\
Options:\n\
  --rom <path>            iNES image to run\n\
  --frames <n>            Frames to emulate (default 600)\n\
  --hash-every <n>        Print the frame SHA-1 every n frames (default off)\n\
  --autoplay <seed>       Drive pad 1 with a seeded random player\n\
  --load-state <path>     Restore a JSON save state before running\n\
  --save-state <path>     Write a JSON save state after running\n\
  -v, --verbose           Log load, reset and interrupt diagnostics\n\
  -h, --help              Show this help\n"
    );
}

/// Presses random buttons in bursts and mashes START when the game's RAM
/// stops changing, which gets most titles past their menus.
struct RandomPlayer {
    seed: u32,
    frame: u32,
    last_ram: Vec<u8>,
    idle_frames: u32,
}

impl RandomPlayer {
    const BURST_FRAMES: u32 = 15;
    const IDLE_LIMIT: u32 = 120;

    fn new(seed: u32) -> Self {
        Self {
            seed,
            frame: 0,
            last_ram: Vec::new(),
            idle_frames: 0,
        }
    }

    fn next_random(&mut self) -> u32 {
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed = x;
        x
    }

    fn random_mask(&mut self) -> u8 {
        let x = self.next_random();
        let buttons = [
            BUTTON_UP,
            BUTTON_DOWN,
            BUTTON_LEFT,
            BUTTON_RIGHT,
            BUTTON_A,
            BUTTON_B,
            BUTTON_START,
            BUTTON_SELECT,
        ];
        let mut mask = buttons
            .iter()
            .enumerate()
            .filter(|(bit, _)| x & (1 << bit) != 0)
            .fold(0u8, |mask, (_, &button)| mask | button);

        // Opposite directions can't be held together on a real pad.
        if mask & BUTTON_UP != 0 {
            mask &= !BUTTON_DOWN;
        }
        if mask & BUTTON_LEFT != 0 {
            mask &= !BUTTON_RIGHT;
        }
        mask
    }
}

impl AutoPlayer for RandomPlayer {
    fn push_ram_snapshot(&mut self, ram: &[u8]) {
        if self.last_ram == ram {
            self.idle_frames += 1;
        } else {
            self.idle_frames = 0;
            self.last_ram.clear();
            self.last_ram.extend_from_slice(ram);
        }
    }

    fn next_button_mask(&mut self) -> u8 {
        self.frame = self.frame.wrapping_add(1);
        if self.idle_frames >= Self::IDLE_LIMIT {
            self.idle_frames = 0;
            return BUTTON_START;
        }
        if self.frame % Self::BURST_FRAMES == 0 {
            self.random_mask()
        } else {
            0
        }
    }
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    init_logger(cfg.verbose)?;

    let rom = cfg
        .rom
        .as_ref()
        .context("no ROM given, pass --rom <path> (see --help)")?;

    let mut nes = Nes::new();
    nes.load_rom_from_path(rom)
        .with_context(|| format!("failed to load ROM {}", rom.display()))?;
    println!("Loaded {} [{}]", rom.display(), nes.mapper_name());

    if let Some(path) = &cfg.load_state {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read save state {}", path.display()))?;
        let state = SaveState::from_json(&text)?;
        nes.load_state_or_reset(&state)
            .with_context(|| format!("save state {} was rejected", path.display()))?;
        println!("Restored state from {}", path.display());
    }

    if cfg.hash_every > 0 {
        let every = u64::from(cfg.hash_every);
        nes.set_vblank_callback(Box::new(move |frame| {
            if frame.frame % every == 0 {
                println!("frame={:06} sha1={}", frame.frame, frame_sha1(frame.pixels));
            }
        }));
    }
    nes.set_breakpoint_callback(Box::new(|pc| {
        log::warn!("CPU halted at ${pc:04X}");
    }));

    let start = Instant::now();
    let mut player = cfg.autoplay_seed.map(RandomPlayer::new);
    for _ in 0..cfg.frames {
        match player.as_mut() {
            Some(player) => nes.step_frame_with(player),
            None => nes.run_frame(),
        };
        if nes.is_paused() {
            println!("CPU halted at ${:04X}, stopping early", nes.cpu().pc());
            break;
        }
    }
    let elapsed = start.elapsed().as_secs_f32();

    if let Some(path) = &cfg.save_state {
        let text = nes.save_state()?.to_json()?;
        fs::write(path, text)
            .with_context(|| format!("failed to write save state {}", path.display()))?;
        println!("Saved state to {}", path.display());
    }

    let counters = nes.debug_counters();
    let cpu = nes.cpu().debug_counters();
    println!();
    println!("Run Summary");
    println!("- frames: {}", counters.frame_count);
    println!("- cpu cycles: {}", nes.cpu().cycles());
    println!("- instructions: {}", cpu.instructions);
    println!("- nmi/irq serviced: {}/{}", cpu.nmi_serviced, cpu.irq_serviced);
    println!("- unofficial opcodes: {}", cpu.unofficial_executed);
    println!("- oam dma transfers: {}", counters.dma_transfers);
    println!("- final frame sha1: {}", frame_sha1(nes.frame_buffer()));
    if elapsed > 0.0 {
        println!(
            "- speed: {:.1} fps ({:.2}s)",
            counters.frame_count as f32 / elapsed,
            elapsed
        );
    }

    Ok(())
}

use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use raster8::cli::{frame_sha1, init_logger, parse_hex_u16};
use raster8::nes::Nes;
use raster8::nes::ppu::{FRAME_HEIGHT, FRAME_WIDTH};
use raster8::nes::state::SaveState;

const PATTERN_WIDTH: usize = 256;
const PATTERN_HEIGHT: usize = 128;
const NAME_TABLE_WIDTH: usize = 512;
const NAME_TABLE_HEIGHT: usize = 480;

/// What the command loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

fn print_help(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "Commands:")?;
    writeln!(out, "  step, s [n]        - Step n instructions (default 1)")?;
    writeln!(out, "  run, r [frames]    - Run frames until a breakpoint (default 1)")?;
    writeln!(out, "  bp <addr>          - Set breakpoint at address")?;
    writeln!(out, "  del <addr>         - Remove breakpoint")?;
    writeln!(out, "  regs               - Show CPU registers")?;
    writeln!(out, "  mem <addr>         - Show 16 bytes of CPU memory")?;
    writeln!(out, "  ppu                - Show PPU state")?;
    writeln!(out, "  apu                - Show sound channel state")?;
    writeln!(out, "  mapper             - Show mapper state")?;
    writeln!(out, "  events [n]         - Show recent console events")?;
    writeln!(out, "  stats              - Show bus and CPU counters")?;
    writeln!(out, "  save <path>        - Write a JSON save state")?;
    writeln!(out, "  load <path>        - Restore a JSON save state")?;
    writeln!(out, "  dump frame|chr|nt <path> - Write a PPM image")?;
    writeln!(out, "  reset              - Reset the console")?;
    writeln!(out, "  quit, q            - Exit debugger")?;
    Ok(())
}

fn parse_count(arg: Option<&&str>, default: u32) -> Result<u32> {
    match arg {
        Some(text) => text
            .parse::<u32>()
            .with_context(|| format!("invalid count: {text}")),
        None => Ok(default),
    }
}

fn print_regs(nes: &Nes, out: &mut dyn Write) -> Result<()> {
    let (a, x, y, p, sp, pc) = nes.cpu().registers();
    writeln!(out, "A: ${a:02X}  X: ${x:02X}  Y: ${y:02X}")?;
    writeln!(out, "P: {p:08b} (NVUBDIZC)")?;
    writeln!(out, "SP: ${sp:02X}  PC: ${pc:04X}")?;
    writeln!(
        out,
        "Cycles: {}  Scanline: {}{}",
        nes.cpu().cycles(),
        nes.hcount(),
        if nes.is_paused() { "  [paused]" } else { "" }
    )?;
    Ok(())
}

fn write_ppm(path: &Path, rgba: &[u8], width: usize, height: usize) -> Result<()> {
    let mut out = format!("P6\n{width} {height}\n255\n").into_bytes();
    for px in rgba.chunks_exact(4).take(width * height) {
        out.extend_from_slice(&px[..3]);
    }
    fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// Runs one debugger command against `nes`.
fn execute(nes: &mut Nes, line: &str, out: &mut dyn Write) -> Result<Flow> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = parts.first() else {
        return Ok(Flow::Continue);
    };

    match command {
        "help" | "h" | "?" => print_help(out)?,
        "step" | "s" => {
            let count = parse_count(parts.get(1), 1)?;
            nes.resume();
            for _ in 0..count {
                nes.step();
                if nes.is_paused() {
                    break;
                }
            }
            print_regs(nes, out)?;
        }
        "run" | "r" => {
            let frames = parse_count(parts.get(1), 1)?;
            nes.resume();
            for _ in 0..frames {
                nes.run_frame();
                if nes.is_paused() {
                    writeln!(out, "Stopped at ${:04X}", nes.cpu().pc())?;
                    break;
                }
            }
            print_regs(nes, out)?;
        }
        "bp" => {
            let addr = parse_hex_u16(parts.get(1).context("usage: bp <addr>")?)?;
            nes.add_breakpoint(addr);
            writeln!(out, "Breakpoint set at ${addr:04X}")?;
        }
        "del" => {
            let addr = parse_hex_u16(parts.get(1).context("usage: del <addr>")?)?;
            nes.remove_breakpoint(addr);
            writeln!(out, "Breakpoint removed at ${addr:04X}")?;
        }
        "regs" => print_regs(nes, out)?,
        "mem" => {
            let addr = parse_hex_u16(parts.get(1).context("usage: mem <addr>")?)?;
            for row in 0..2u16 {
                let base = addr.wrapping_add(row * 8);
                let bytes: Vec<String> = (0..8u16)
                    .map(|i| format!("{:02X}", nes.debug_peek(base.wrapping_add(i))))
                    .collect();
                writeln!(out, "{base:04X}: {}", bytes.join(" "))?;
            }
        }
        "ppu" => {
            let ppu = nes.ppu();
            let regs = ppu.registers();
            let counters = nes.debug_ppu_counters();
            writeln!(out, "PPU State:")?;
            writeln!(out, "  Scanline: {}", nes.hcount())?;
            writeln!(out, "  $2000 (ctrl):   {:08b}", regs[0])?;
            writeln!(out, "  $2001 (mask):   {:08b}", regs[1])?;
            writeln!(out, "  $2002 (status): {:08b}", regs[2])?;
            writeln!(
                out,
                "  scroll t=${:04X} v=${:04X} mirroring={:?}",
                ppu.scroll_temp(),
                ppu.scroll_curr(),
                ppu.mirror_mode()
            )?;
            writeln!(
                out,
                "  vblanks={} events={} sprite0 hits={} (last line {})",
                counters.vblank_entries,
                counters.events_recorded,
                counters.sprite0_hits,
                counters.sprite0_hit_last_line
            )?;
        }
        "apu" => {
            for ch in 0..nes.sound_channel_count() {
                let kind = nes
                    .sound_channel_kind(ch)
                    .map_or("?", |kind| kind.name());
                writeln!(
                    out,
                    "  {ch}: {kind:<8} freq={:8.2}Hz duty={:.3} volume={:.2}",
                    nes.sound_frequency(ch),
                    nes.sound_duty_ratio(ch),
                    nes.sound_volume(ch)
                )?;
            }
        }
        "mapper" => writeln!(out, "Mapper: {}", nes.debug_mapper_state())?,
        "events" => {
            let limit = parse_count(parts.get(1), 16)? as usize;
            for event in nes.debug_recent_events(limit).iter().rev() {
                writeln!(out, "  {event}")?;
            }
        }
        "stats" => {
            let bus = nes.debug_counters();
            let cpu = nes.cpu().debug_counters();
            writeln!(out, "{bus:#?}")?;
            writeln!(out, "{cpu:#?}")?;
        }
        "save" => {
            let path = Path::new(parts.get(1).context("usage: save <path>")?);
            let text = nes.save_state()?.to_json()?;
            fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            writeln!(out, "Saved state to {}", path.display())?;
        }
        "load" => {
            let path = Path::new(parts.get(1).context("usage: load <path>")?);
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            nes.load_state_or_reset(&SaveState::from_json(&text)?)?;
            writeln!(out, "Loaded state from {}", path.display())?;
        }
        "dump" => {
            let what = parts.get(1).context("usage: dump frame|chr|nt <path>")?;
            let path = Path::new(parts.get(2).context("usage: dump frame|chr|nt <path>")?);
            match *what {
                "frame" => {
                    write_ppm(path, nes.frame_buffer(), FRAME_WIDTH, FRAME_HEIGHT)?;
                    writeln!(out, "frame sha1={}", frame_sha1(nes.frame_buffer()))?;
                }
                "chr" => {
                    let mut pixels = vec![0; PATTERN_WIDTH * PATTERN_HEIGHT * 4];
                    nes.ppu().render_pattern_table(&mut pixels, PATTERN_WIDTH, 0);
                    write_ppm(path, &pixels, PATTERN_WIDTH, PATTERN_HEIGHT)?;
                }
                "nt" => {
                    let mut pixels = vec![0; NAME_TABLE_WIDTH * NAME_TABLE_HEIGHT * 4];
                    nes.ppu().render_name_table(&mut pixels, NAME_TABLE_WIDTH);
                    write_ppm(path, &pixels, NAME_TABLE_WIDTH, NAME_TABLE_HEIGHT)?;
                }
                other => anyhow::bail!("unknown dump target: {other}"),
            }
            writeln!(out, "Wrote {}", path.display())?;
        }
        "reset" => {
            nes.reset();
            print_regs(nes, out)?;
        }
        "quit" | "q" => return Ok(Flow::Quit),
        other => writeln!(
            out,
            "Unknown command: {other}. Type 'help' for available commands."
        )?,
    }
    Ok(Flow::Continue)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|arg| arg == "--verbose" || arg == "-v");
    init_logger(verbose)?;

    let Some(rom_path) = args.iter().skip(1).find(|arg| !arg.starts_with('-')) else {
        println!("Usage: raster8_debug [--verbose] <rom.nes>");
        println!();
        print_help(&mut std::io::stdout())?;
        return Ok(());
    };

    println!("raster8 debugger");
    println!("Loading ROM: {rom_path}");
    let mut nes = Nes::new();
    nes.load_rom_from_path(Path::new(rom_path))
        .with_context(|| format!("failed to load ROM {rom_path}"))?;
    nes.set_breakpoint_callback(Box::new(|pc| println!("Break at ${pc:04X}")));
    println!("Mapper: {}", nes.mapper_name());
    println!("Type 'help' for commands");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        stdout.flush().ok();
        let Some(line) = lines.next() else {
            break;
        };
        match execute(&mut nes, &line?, &mut stdout) {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(err) => println!("error: {err:#}"),
        }
    }

    Ok(())
}

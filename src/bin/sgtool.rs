//! Command-line driver for the scatter-gather cursor.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sgcursor::{
    chain::{self, ArenaStats},
    config::{resolve_config_path, SgConfig},
    metrics::{CounterMetrics, MetricsSnapshot},
    types::page::trunc_page,
    ArenaOptions, BufferArena, BufferPool, CursorError, CursorOptions, MbufCursor, PageTable,
    PhysicalSegment,
};
use tracing_subscriber::EnvFilter;

/// Physical base the simulated page table maps the arena onto.
const PHYS_BASE: u64 = 0x8000_0000;

#[derive(Parser, Debug)]
#[command(
    name = "sgtool",
    version,
    about = "Build DMA segment lists from packet buffer chains",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    tune: TuneArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct TuneArgs {
    #[arg(
        long,
        global = true,
        env = "SGTOOL_CONFIG",
        value_name = "FILE",
        help = "Config file (defaults to the platform config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Page size in bytes")]
    page_size: Option<usize>,

    #[arg(long, global = true, help = "Segment length ceiling in bytes")]
    max_segment_size: Option<usize>,

    #[arg(long, global = true, help = "Default segment budget")]
    max_num_segments: Option<usize>,

    #[arg(long, global = true, help = "Cluster size in bytes")]
    cluster_size: Option<usize>,

    #[arg(long, global = true, help = "Ceiling for the single-segment copy")]
    single_copy_limit: Option<usize>,
}

#[derive(Args, Debug)]
struct TranslateCmd {
    #[arg(
        long,
        required = true,
        value_delimiter = ',',
        value_name = "LEN,LEN",
        help = "Byte length of each node in the chain"
    )]
    lens: Vec<usize>,

    #[arg(
        long,
        help = "Place every node this many bytes into a page instead of using pool buffers"
    )]
    page_offset: Option<usize>,

    #[arg(long, default_value_t = 0, help = "Segment budget (0 uses the default)")]
    max_segs: usize,

    #[arg(long, help = "Fail instead of repacking the chain")]
    no_coalesce: bool,
}

#[derive(Args, Debug)]
struct SimulateCmd {
    #[arg(long, default_value_t = 1000, help = "Packets to translate")]
    packets: usize,

    #[arg(long, default_value_t = 7, help = "Random seed")]
    seed: u64,

    #[arg(long, default_value_t = 24, help = "Most nodes in one packet")]
    max_nodes: usize,

    #[arg(long, default_value_t = 1500, help = "Longest node in bytes")]
    max_node_len: usize,

    #[arg(long, default_value_t = 4, help = "Segment budget per packet")]
    max_segs: usize,

    #[arg(
        long,
        default_value_t = 0.0,
        help = "Probability that one node of a packet sits on an unmapped page"
    )]
    unmapped_rate: f64,

    #[arg(long, help = "Fail instead of repacking chains")]
    no_coalesce: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Translate one chain built from explicit node lengths")]
    Translate(TranslateCmd),
    #[command(about = "Translate random chains and check every result")]
    Simulate(SimulateCmd),
    #[command(about = "Print the config file location")]
    ConfigPath,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct TranslateReport {
    packet_len: usize,
    budget: usize,
    segment_count: usize,
    coalesced: bool,
    nodes_before: usize,
    nodes_after: usize,
    segments: Vec<PhysicalSegment>,
}

#[derive(Serialize, Default)]
struct SimulateReport {
    packets: usize,
    succeeded: u64,
    failures: BTreeMap<&'static str, u64>,
    segments: u64,
    violations: Vec<String>,
    leaked_nodes: usize,
    coalesce_count: u64,
    packet_too_big_count: u64,
    metrics: MetricsSnapshot,
    arena: ArenaStats,
}

#[derive(Serialize)]
struct ConfigPathReport {
    path: PathBuf,
    exists: bool,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sgcursor=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Translate(cmd) => {
            let (cursor_opts, arena_opts) = build_options(&cli.tune)?;
            let report = run_translate(cmd, cursor_opts, arena_opts)?;
            emit(&cli.format, &report, || print_translate_text(&report))?;
        }
        Command::Simulate(cmd) => {
            let (cursor_opts, arena_opts) = build_options(&cli.tune)?;
            let report = run_simulate(cmd, cursor_opts, arena_opts)?;
            emit(&cli.format, &report, || print_simulate_text(&report))?;
            if !report.violations.is_empty() || report.leaked_nodes != 0 {
                std::process::exit(2);
            }
        }
        Command::ConfigPath => {
            let path = resolve_config_path(cli.tune.config.as_deref())?;
            let report = ConfigPathReport {
                exists: path.exists(),
                path,
            };
            emit(&cli.format, &report, || println!("{}", report.path.display()))?;
        }
    }

    Ok(())
}

fn build_options(args: &TuneArgs) -> Result<(CursorOptions, ArenaOptions), Box<dyn Error>> {
    let mut config = SgConfig::load_or_default(args.config.as_deref())?;
    if let Some(page_size) = args.page_size {
        config.cursor.page_size = Some(page_size);
    }
    if let Some(bytes) = args.max_segment_size {
        config.cursor.max_segment_size = Some(bytes);
    }
    if let Some(count) = args.max_num_segments {
        config.cursor.max_num_segments = Some(count);
    }
    if let Some(limit) = args.single_copy_limit {
        config.cursor.single_copy_limit = Some(limit);
    }
    if let Some(bytes) = args.cluster_size {
        config.arena.cluster_size = Some(bytes);
    }
    let arena = config.arena_options()?;
    Ok((config.cursor_options(), arena))
}

fn run_translate(
    cmd: &TranslateCmd,
    cursor_opts: CursorOptions,
    arena_opts: ArenaOptions,
) -> Result<TranslateReport, Box<dyn Error>> {
    let table = PageTable::linear(arena_opts.page_size, arena_opts.base_addr, PHYS_BASE);
    let mut arena = BufferArena::new(arena_opts)?;
    let cursor = MbufCursor::new(cursor_opts)?;

    let parts: Vec<Vec<u8>> = cmd
        .lens
        .iter()
        .enumerate()
        .map(|(n, &len)| (0..len).map(|i| (n * 7 + i) as u8).collect())
        .collect();
    let head = match cmd.page_offset {
        Some(offset) => {
            let mut ids = Vec::with_capacity(parts.len());
            for part in &parts {
                let id = arena
                    .alloc_external(part.len(), offset)
                    .ok_or(CursorError::AllocationFailed("external node"))?;
                arena.node_mut(id).fill(part);
                ids.push(id);
            }
            arena.link_packet(&ids)?
        }
        None => {
            let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
            arena.packet_from_slices(&slices)?
        }
    };
    let packet_len = arena.node(head).packet_len();
    let nodes_before = chain::chain_nodes(&arena, head);

    let mut segments = Vec::new();
    let count = cursor.translate(
        &mut arena,
        &table,
        head,
        &mut segments,
        cmd.max_segs,
        !cmd.no_coalesce,
    )?;
    segments.truncate(count);

    Ok(TranslateReport {
        packet_len,
        budget: if cmd.max_segs == 0 {
            cursor.max_num_segments()
        } else {
            cmd.max_segs
        },
        segment_count: count,
        coalesced: cursor.coalesce_count() > 0,
        nodes_before,
        nodes_after: chain::chain_nodes(&arena, head),
        segments,
    })
}

fn run_simulate(
    cmd: &SimulateCmd,
    cursor_opts: CursorOptions,
    arena_opts: ArenaOptions,
) -> Result<SimulateReport, Box<dyn Error>> {
    if cmd.max_nodes == 0 || cmd.max_node_len == 0 {
        return Err("--max-nodes and --max-node-len must be positive".into());
    }
    if !(0.0..=1.0).contains(&cmd.unmapped_rate) {
        return Err("--unmapped-rate must be between 0 and 1".into());
    }
    let page_size = arena_opts.page_size;
    let mut table = PageTable::linear(page_size, arena_opts.base_addr, PHYS_BASE);
    let mut arena = BufferArena::new(arena_opts)?;
    let metrics = Arc::new(CounterMetrics::default());
    let cursor = MbufCursor::new(cursor_opts.metrics(metrics.clone()))?;
    let budget = if cmd.max_segs == 0 {
        cursor.max_num_segments()
    } else {
        cmd.max_segs
    };
    let mut rng = ChaCha8Rng::seed_from_u64(cmd.seed);
    let mut report = SimulateReport {
        packets: cmd.packets,
        ..SimulateReport::default()
    };

    for packet in 0..cmd.packets {
        let node_count = rng.gen_range(1..=cmd.max_nodes);
        let parts: Vec<Vec<u8>> = (0..node_count)
            .map(|_| {
                let mut part = vec![0u8; rng.gen_range(1..=cmd.max_node_len)];
                rng.fill(part.as_mut_slice());
                part
            })
            .collect();
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let head = arena.packet_from_slices(&slices)?;
        let original = chain::chain_bytes(&arena, head);

        if cmd.unmapped_rate > 0.0 && rng.gen_bool(cmd.unmapped_rate) {
            let victim = rng.gen_range(0..node_count);
            if let Some(id) = chain::iter(&arena, head).nth(victim) {
                table.unmap_page(arena.node(id).data_addr());
            }
        }

        let mut segments = Vec::new();
        match cursor.translate(
            &mut arena,
            &table,
            head,
            &mut segments,
            cmd.max_segs,
            !cmd.no_coalesce,
        ) {
            Ok(count) => {
                report.succeeded += 1;
                report.segments += count as u64;
                check_result(
                    packet,
                    &segments[..count.min(segments.len())],
                    count,
                    original.len(),
                    budget,
                    &cursor,
                    page_size,
                    &mut report.violations,
                );
                if chain::chain_bytes(&arena, head) != original {
                    report
                        .violations
                        .push(format!("packet {packet}: bytes changed by translation"));
                }
            }
            Err(err) => {
                *report.failures.entry(error_kind(&err)).or_default() += 1;
                if chain::chain_bytes(&arena, head) != original {
                    report
                        .violations
                        .push(format!("packet {packet}: failed translation changed bytes"));
                }
            }
        }
        arena.free_chain(Some(head));
    }

    report.leaked_nodes = arena.live_nodes();
    report.coalesce_count = cursor.coalesce_count();
    report.packet_too_big_count = cursor.packet_too_big_count();
    report.metrics = metrics.snapshot();
    report.arena = arena.stats();
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn check_result(
    packet: usize,
    segments: &[PhysicalSegment],
    count: usize,
    packet_len: usize,
    budget: usize,
    cursor: &MbufCursor,
    page_size: usize,
    violations: &mut Vec<String>,
) {
    if segments.len() != count {
        violations.push(format!(
            "packet {packet}: sink holds {} segments, cursor reported {count}",
            segments.len()
        ));
    }
    if count > budget {
        violations.push(format!("packet {packet}: {count} segments over budget {budget}"));
    }
    let total: usize = segments.iter().map(|s| s.length).sum();
    if total != packet_len {
        violations.push(format!(
            "packet {packet}: segments cover {total} of {packet_len} bytes"
        ));
    }
    for seg in segments {
        let last = seg.location.get() + seg.length as u64 - 1;
        if trunc_page(seg.location.get(), page_size) != trunc_page(last, page_size) {
            violations.push(format!(
                "packet {packet}: segment at {} crosses a page",
                seg.location
            ));
        }
        if seg.length > cursor.max_segment_size() {
            violations.push(format!(
                "packet {packet}: segment of {} bytes over the size ceiling",
                seg.length
            ));
        }
    }
}

fn error_kind(err: &CursorError) -> &'static str {
    match err {
        CursorError::NotAPacket(_) => "not_a_packet",
        CursorError::NoSegmentBudget => "no_segment_budget",
        CursorError::EmptyPacket => "empty_packet",
        CursorError::Unmapped(_) => "unmapped",
        CursorError::BudgetExceeded { .. } => "budget_exceeded",
        CursorError::PacketTooBig { .. } => "packet_too_big",
        CursorError::TooLargeForSingleCopy { .. } => "too_large_for_single_copy",
        CursorError::AllocationFailed(_) => "allocation_failed",
        CursorError::InvalidArgument(_) => "invalid_argument",
    }
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_translate_text(report: &TranslateReport) {
    println!(
        "packet_len={} budget={} segments={} coalesced={} nodes={}->{}",
        report.packet_len,
        report.budget,
        report.segment_count,
        report.coalesced,
        report.nodes_before,
        report.nodes_after
    );
    for (index, seg) in report.segments.iter().enumerate() {
        println!("  [{index}] {} len={}", seg.location, seg.length);
    }
}

fn print_simulate_text(report: &SimulateReport) {
    println!(
        "packets={} succeeded={} segments={} coalesced={} too_big={}",
        report.packets,
        report.succeeded,
        report.segments,
        report.coalesce_count,
        report.packet_too_big_count
    );
    for (kind, count) in &report.failures {
        println!("  failed {kind}: {count}");
    }
    println!(
        "metrics: fast_paths={} single_copies={} unmapped={}",
        report.metrics.fast_paths, report.metrics.single_copies, report.metrics.unmapped
    );
    println!(
        "arena: allocs={} frees={} clusters={} failed={} leaked={}",
        report.arena.allocs,
        report.arena.frees,
        report.arena.cluster_allocs,
        report.arena.failed_allocs,
        report.leaked_nodes
    );
    if report.violations.is_empty() {
        println!("invariants: ok");
    } else {
        println!("invariants: {} violations", report.violations.len());
        for violation in &report.violations {
            println!("  {violation}");
        }
    }
}

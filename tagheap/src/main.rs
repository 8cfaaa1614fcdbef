use std::{cell::Cell, mem::offset_of};

use clap::Parser;
use tagheap::{
    FileWriter, Gc, HeapSettings, LineReader, Managed, RootFrame, Shape, Str, Violation, Writer,
    alloc_str, heap, new_buf, new_dict, new_line_reader, new_list,
};

#[derive(Parser, Debug)]
#[command(name = "tagheap", about = "Exercise the tagged heap under allocation pressure")]
struct Args {
    /// Allocation rounds to run
    #[arg(long, default_value_t = 200)]
    rounds: usize,
    /// Objects built per round
    #[arg(long, default_value_t = 64)]
    width: usize,
    /// Depth of the binary tree built each round
    #[arg(long, default_value_t = 8)]
    depth: u32,
    /// Keep every n-th round's results alive until the end
    #[arg(long, default_value_t = 10)]
    keep_every: usize,
    /// Initial collection threshold in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    threshold: usize,
    #[arg(long, default_value_t = 2.0)]
    growth: f64,
    /// Abort once the heap would hold more than this many bytes
    #[arg(long)]
    max_bytes: Option<usize>,
}

#[repr(C)]
struct Node {
    left: Cell<Option<Gc<Node>>>,
    label: Cell<Option<Gc<Str>>>,
    right: Cell<Option<Gc<Node>>>,
    weight: Cell<i64>,
}

impl Managed for Node {
    fn shape() -> Result<Shape, Violation> {
        Shape::fixed::<Self>("Node")
            .pointer(offset_of!(Self, left))
            .pointer(offset_of!(Self, label))
            .pointer(offset_of!(Self, right))
            .build()
    }
}

fn tree(depth: u32, weight: i64) -> Gc<Node> {
    let frame = RootFrame::new();
    let left = frame.root_null::<Node>();
    let right = frame.root_null::<Node>();
    if depth > 0 {
        left.set(Some(tree(depth - 1, weight * 2)));
        right.set(Some(tree(depth - 1, weight * 2 + 1)));
    }
    let label = alloc_str(format!("node {weight}").as_bytes());
    heap::alloc(Node {
        left: Cell::new(left.get()),
        label: Cell::new(Some(label)),
        right: Cell::new(right.get()),
        weight: Cell::new(weight),
    })
}

fn checksum(node: Option<Gc<Node>>) -> i64 {
    node.map_or(0, |n| {
        n.weight.get() + checksum(n.left.get()) + checksum(n.right.get())
    })
}

fn round(args: &Args, index: usize) -> tagheap::Result<Gc<Str>> {
    let frame = RootFrame::new();
    let root = frame.root(tree(args.depth, 1));

    let words = frame.root(new_list::<Gc<Str>>());
    let counts = frame.root(new_dict::<Gc<Str>, i64>());
    let out = frame.root(new_buf(16));
    for i in 0..args.width {
        let word = alloc_str(format!("w{}", (i * 7 + index) % 13).as_bytes());
        words.get().append(word);
        let seen = counts.get().get(word).unwrap_or(0);
        counts.get().insert(word, seen + 1);
        if seen > 2 {
            counts.get().erase(word);
        }
    }

    let text = alloc_str(b"alpha\nbeta\ngamma\n");
    let mut reader = frame.root(new_line_reader(text)).get();
    let mut writer = out.get();
    while let Some(line) = reader.read_line()? {
        writer.write(line)?;
    }
    for (key, count) in counts.get().iter() {
        writer.write(key)?;
        writer.write(alloc_str(format!("={count};").as_bytes()))?;
    }
    log::debug!(
        "round {index}: tree checksum {}, {} words, {} distinct",
        checksum(Some(root.get())),
        words.get().len(),
        counts.get().len()
    );
    out.get().freeze()
}

fn main() -> tagheap::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = HeapSettings::with_size_hint(args.threshold).with_growth_factor(args.growth);
    if let Some(max_bytes) = args.max_bytes {
        settings = settings.with_max_bytes(max_bytes);
    }
    heap::init(settings);

    let mut stdout = FileWriter::stdout();
    {
        let frame = RootFrame::new();
        let kept = frame.root(new_list::<Gc<Str>>());
        for index in 0..args.rounds {
            let summary = round(&args, index)?;
            if args.keep_every > 0 && index % args.keep_every == 0 {
                kept.get().append(summary);
            }
        }
        heap::collect();
        let kept = kept.get();
        log::info!("kept {} summaries", kept.len());
        if let Some(last) = kept.iter().last() {
            stdout.write(last)?;
            stdout.write(alloc_str(b"\n"))?;
        }
    }

    let stats = heap::stats();
    let report = alloc_str(format!("{stats:#?}\n").as_bytes());
    stdout.write(report)?;
    stdout.flush()?;
    heap::clean_exit();
    Ok(())
}

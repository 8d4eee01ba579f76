use clap::Parser;
use ffi_memory::{
    types::ArrayType, ByteOrder, FfiError, NativeLayout, Runtime, StructLayoutBuilder, Type,
};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Compute and print the C layout of a struct"
)]
struct Args {
    /// Fields as name:type, name:type[N] for arrays, with an optional @offset
    /// (e.g. flags:uint8 data:int32[4] tail:double@16)
    #[arg(required = true)]
    fields: Vec<String>,
    /// Place every field at offset 0
    #[arg(short, long)]
    union: bool,
    /// Cap field alignment at N bytes
    #[arg(short, long, value_name = "N")]
    packed: Option<usize>,
    /// Byte order of numeric fields (little, big, network, native)
    #[arg(short, long, default_value = "native")]
    order: String,
}

struct FieldArg<'a> {
    name: &'a str,
    ty: &'a str,
    length: Option<usize>,
    offset: Option<usize>,
}

fn parse_field(arg: &str) -> Result<FieldArg<'_>, FfiError> {
    let invalid = || FfiError::InvalidArgument(format!("malformed field {arg:?}"));
    let (name, rest) = arg.split_once(':').ok_or_else(invalid)?;
    let (ty, offset) = match rest.split_once('@') {
        Some((ty, offset)) => (ty, Some(offset.parse().map_err(|_| invalid())?)),
        None => (rest, None),
    };
    let (ty, length) = match ty.strip_suffix(']').and_then(|t| t.split_once('[')) {
        Some((ty, len)) => (ty, Some(len.parse().map_err(|_| invalid())?)),
        None => (ty, None),
    };
    Ok(FieldArg {
        name,
        ty,
        length,
        offset,
    })
}

fn run(args: &Args) -> Result<(), FfiError> {
    let runtime = Runtime::new();
    let mut builder = if args.union {
        StructLayoutBuilder::union(&runtime)
    } else {
        StructLayoutBuilder::new(&runtime)
    };
    if let Some(packing) = args.packed {
        builder.packed(packing)?;
    }
    builder.order(ByteOrder::parse(&args.order)?);

    for arg in &args.fields {
        let field = parse_field(arg)?;
        let mut ty = runtime.resolve(field.ty)?;
        if let Some(length) = field.length {
            ty = Type::from(ArrayType::new(ty, length));
        }
        match field.offset {
            Some(offset) => builder.add_at(field.name, ty, offset)?,
            None => builder.add(field.name, ty)?,
        };
    }

    let layout = builder.build()?;
    for field in layout.fields() {
        println!(
            "{:>6}  {:<16} {} ({} bytes, align {})",
            field.offset(),
            field.name().as_str(),
            field.ty().describe(),
            field.size(),
            field.ty().alignment()
        );
    }
    println!(
        "size {}, alignment {}{}",
        layout.size(),
        layout.alignment(),
        if layout.is_union() { ", union" } else { "" }
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

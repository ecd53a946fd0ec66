// Command line driver for the scflow pipeline

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::info;
use scflow::integration::MethodName;
use scflow::snapshot::Stage;
use scflow::{Pipeline, PipelineConfig};
use std::path::PathBuf;

fn config_arg() -> Arg {
    Arg::new("CONFIG")
        .help("Pipeline configuration (TOML)")
        .short('c')
        .long("config")
        .default_value("scflow.toml")
        .value_parser(value_parser!(PathBuf))
}

fn method_arg() -> Arg {
    Arg::new("METHOD")
        .help("Integration method whose clustering is annotated")
        .short('m')
        .long("method")
        .value_parser(["cca", "harmony", "rpca", "jointpca"])
}

fn cli() -> Command {
    Command::new("scflow-cmd")
        .about("Single-cell RNA-seq pipeline: ingest, qc, integrate, annotate")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("init-config")
                .about("Write a configuration template")
                .arg(
                    Arg::new("OUTPUT")
                        .help("Where to write the template")
                        .index(1)
                        .default_value("scflow.toml")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("FORCE")
                        .help("Overwrite an existing file")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("ingest").about("Load and merge the samples").arg(config_arg()))
        .subcommand(Command::new("qc").about("Remove doublets and low-quality cells").arg(config_arg()))
        .subcommand(Command::new("integrate").about("Run the integration methods").arg(config_arg()))
        .subcommand(
            Command::new("annotate")
                .about("Find conserved markers and transfer reference labels")
                .arg(config_arg())
                .arg(method_arg()),
        )
        .subcommand(Command::new("run").about("Run every stage").arg(config_arg()))
        .subcommand(
            Command::new("export")
                .about("Write the tables of a stage snapshot")
                .arg(config_arg())
                .arg(
                    Arg::new("STAGE")
                        .help("Snapshot to export")
                        .short('s')
                        .long("stage")
                        .default_value("annotated")
                        .value_parser(["merged", "qc_passed", "qc_split", "integrated", "annotated"]),
                )
                .arg(
                    Arg::new("OUT_DIR")
                        .help("Output directory")
                        .short('o')
                        .long("out_dir")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn pipeline(matches: &ArgMatches) -> Result<Pipeline, Error> {
    let path: &PathBuf = matches.get_one("CONFIG").expect("CONFIG has a default");
    let config = PipelineConfig::load(path)?;
    Ok(Pipeline::new(config))
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("init-config", m)) => {
            let out: &PathBuf = m.get_one("OUTPUT").expect("OUTPUT has a default");
            if out.exists() && !m.get_flag("FORCE") {
                anyhow::bail!("{} exists; pass --force to overwrite", out.display());
            }
            std::fs::write(out, PipelineConfig::template()?).with_context(|| out.display().to_string())?;
            info!("wrote configuration template to {}", out.display());
        }
        Some(("ingest", m)) => {
            let merged = pipeline(m)?.run_ingest()?;
            info!("{} cells x {} genes after ingest", merged.num_cells(), merged.num_genes());
        }
        Some(("qc", m)) => {
            let parts = pipeline(m)?.run_qc()?;
            for p in &parts {
                info!("{}: {} cells pass qc", p.sample_id, p.dataset.num_cells());
            }
        }
        Some(("integrate", m)) => {
            let integrated = pipeline(m)?.run_integrate()?;
            println!("embedding\tmethod\tmixing_mean\tmixing_median");
            for s in &integrated.mixing {
                println!("{}\t{}\t{:.3}\t{:.3}", s.embedding, s.method, s.mean, s.median);
            }
        }
        Some(("annotate", m)) => {
            let method = m.get_one::<String>("METHOD").map(|s| s.parse::<MethodName>()).transpose()?;
            let annotated = pipeline(m)?.run_annotate(method)?;
            info!(
                "{}: {} filtered markers, {} labelled cells",
                annotated.cluster_key,
                annotated.filtered_markers.len(),
                annotated.predictions.len()
            );
        }
        Some(("run", m)) => {
            pipeline(m)?.run_all()?;
        }
        Some(("export", m)) => {
            let stage: Stage = m.get_one::<String>("STAGE").expect("STAGE has a default").parse()?;
            let out_dir = m.get_one::<PathBuf>("OUT_DIR");
            for f in pipeline(m)?.export(stage, out_dir.map(|p| p.as_path()))? {
                println!("{}", f.display());
            }
        }
        _ => unreachable!("subcommand_required"),
    }
    Ok(())
}

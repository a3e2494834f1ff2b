// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of NetProbe — Licensed under AGPL-3.0-or-later.

//! End-to-end demo: synthesizes a tiny model zoo, trains the detector for a
//! couple of epochs, and evaluates it on the train and validation splits.
//!
//! ```bash
//! cargo run --example train_detector -p np-detect
//! ```

use np_detect::{
    telemetry, zoo, DatasetFamily, EvaluationLoop, InputSaliencyExtractor, ModelCorpusIndex,
    RunConfig, TrainingLoop, UniformSeeder, SUPPORTED_FAMILIES,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing()?;

    let root = std::env::temp_dir().join("netprobe-demo");
    let config = RunConfig::new(
        root.join("corpus"),
        root.join("references"),
        root.join("snapshot.json"),
    )
    .with_num_queries(4)
    .with_epochs(2)
    .with_learning_rate(1e-3)
    .with_seed(7);
    config.validate()?;

    // Point the demo at an empty directory and it fabricates its own zoo.
    if !config.corpus_root().exists() {
        zoo::synthesize_corpus(config.corpus_root(), DatasetFamily::Cifar10, 4, 4, 7)?;
        zoo::synthesize_corpus(config.corpus_root(), DatasetFamily::Gtsrb, 2, 2, 19)?;
        zoo::synthesize_references(config.reference_root(), &SUPPORTED_FAMILIES, 7)?;
    }

    let corpus = ModelCorpusIndex::open_training(config.corpus_root())?;
    let split = corpus.split(config.split_fraction(), config.seed())?;
    println!(
        "corpus: {} models ({} train / {} validation)",
        corpus.len(),
        split.train.len(),
        split.validation.len()
    );

    let extractor = InputSaliencyExtractor::new(4, config.seed())?;
    let seeder = UniformSeeder::new(config.seed());
    let mut training = TrainingLoop::new(&config, &extractor, &seeder)?;
    let history = training.run(&corpus, &split.train)?;
    for stats in &history {
        println!(
            "epoch {}: {} examples, {} skipped, loss ema {:.4}, lr {:.2e}",
            stats.epoch + 1,
            stats.examples,
            stats.skipped,
            stats.loss_ema,
            stats.learning_rate
        );
    }

    let references = training.references().clone();
    let (fusion, bank) = training.components();
    let evaluator = EvaluationLoop::new(&config, &references, &extractor)?;

    let train_report = evaluator.evaluate(fusion, bank, &corpus, &split.train)?;
    println!(
        "train: loss {:.3}, accuracy {:.1}%",
        train_report.mean_loss,
        train_report.accuracy * 100.0
    );
    println!("{}", train_report.confusion);

    let val_report = evaluator.evaluate(fusion, bank, &corpus, &split.validation)?;
    println!(
        "validation: loss {:.3}, accuracy {:.1}%",
        val_report.mean_loss,
        val_report.accuracy * 100.0
    );
    println!("{}", val_report.confusion);
    match val_report.auroc() {
        Some(auroc) => println!("validation AUROC: {auroc:.3}"),
        None => println!("validation AUROC: undefined (single-class slice)"),
    }

    println!("snapshot written to {}", config.snapshot_path().display());
    Ok(())
}

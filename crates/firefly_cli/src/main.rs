//! ff_insert: reconstruct rational coefficient functions from expression
//! files.
//!
//! The input file is a sum of terms, each referencing one basis function of
//! a family listed in `config/functions` (e.g. `fam[1,0,2]`) multiplied by
//! a coefficient expression in the variables of `config/vars`. The
//! coefficients are reconstructed over prime fields and written to
//! `out_<family>` files in Horner form.

mod parser;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::RwLock;
use std::time::Instant;

use clap::Parser;
use log::{error, info};

use firefly_core::{BlackBox, FFInt, Reconstructor};
use parser::ParsedExpression;

#[derive(Parser)]
#[command(name = "ff_insert")]
#[command(about = "Reconstruct rational coefficient functions from expression files")]
#[command(version)]
struct Cli {
    /// Number of worker threads
    #[arg(short = 'p', long = "parallel", default_value = "1")]
    parallel: usize,

    /// Maximum bunch size (1, 2, 4, 8, 16, 32, 64 or 128)
    #[arg(long = "bunchsize", short_alias = 'b', alias = "bs", default_value = "1")]
    bunchsize: usize,

    /// Run the factor scan, write its results and stop
    #[arg(long = "factorscan", alias = "fs")]
    factorscan: bool,

    /// Disable the factor scan
    #[arg(long = "nofactorscan", alias = "nfs")]
    nofactorscan: bool,

    /// Skip the interpolation and write unsimplified coefficient files
    #[arg(long = "nointerpolation", alias = "ni")]
    nointerpolation: bool,

    /// Enable tagged checkpointing under ff_save/
    #[arg(short = 's', long = "save")]
    save: bool,

    /// Merge a directory of result fragments into one file per family
    #[arg(short = 'm', long = "merge")]
    merge: bool,

    /// Input file or directory
    input: PathBuf,
}

/// A black box evaluating one parsed coefficient expression per basis
/// function.
struct ExpressionBlackBox {
    expressions: Vec<RwLock<ParsedExpression>>,
}

impl BlackBox for ExpressionBlackBox {
    fn eval(&self, values: &[FFInt], _thread_id: usize) -> Vec<FFInt> {
        self.expressions
            .iter()
            .map(|expr| expr.read().unwrap().eval(values))
            .collect()
    }

    fn prime_changed(&self) {
        for expr in &self.expressions {
            expr.write().unwrap().precompute_tokens();
        }
    }
}

fn main() -> ExitCode {
    let start = Instant::now();

    let log_file = match fs::File::create("ff_insert.log") {
        Ok(file) => file,
        Err(e) => {
            eprintln!("FireFly error: cannot open ff_insert.log: {e}");
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(TeeWriter::new(log_file))))
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => {
            info!("FireFly info: total runtime: {:.3} s", start.elapsed().as_secs_f64());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Writes log lines to stderr and to ff_insert.log.
struct TeeWriter {
    file: fs::File,
}

impl TeeWriter {
    fn new(file: fs::File) -> Self {
        Self { file }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    if !firefly_core::black_box::ALLOWED_BUNCH_SIZES.contains(&cli.bunchsize) {
        return Err(format!(
            "FireFly error: bunch size {} is not one of {:?}",
            cli.bunchsize,
            firefly_core::black_box::ALLOWED_BUNCH_SIZES
        ));
    }

    if cli.merge {
        return merge_results(&cli.input);
    }

    let families = read_config_list("config/functions")
        .map_err(|_| "FireFly error: please add a file defining the occurring functions in 'config/functions'".to_string())?;
    let vars = read_config_list("config/vars")
        .map_err(|_| "FireFly error: please add a file defining the occurring variables in 'config/vars'".to_string())?;

    if vars.is_empty() {
        return Err(
            "FireFly error: functional reconstruction without variables is not supported"
                .to_string(),
        );
    }

    let skip: HashSet<String> = read_config_list("config/skip_functions")
        .unwrap_or_default()
        .into_iter()
        .collect();
    if !skip.is_empty() {
        info!(
            "FireFly info: skipping reconstruction of {} basis function(s)",
            skip.len()
        );
    }

    // Collect the input expressions.
    let mut inputs: Vec<PathBuf> = Vec::new();
    if cli.input.is_dir() {
        for entry in fs::read_dir(&cli.input).map_err(|e| format!("FireFly error: {e}"))? {
            let entry = entry.map_err(|e| format!("FireFly error: {e}"))?;
            if entry.path().is_file() {
                inputs.push(entry.path());
            }
        }
        inputs.sort();
    } else if cli.input.is_file() {
        inputs.push(cli.input.clone());
    } else {
        return Err(format!(
            "FireFly error: input file '{}' does not exist",
            cli.input.display()
        ));
    }

    // Per basis function: the collected coefficient expression.
    let mut coefficients: HashMap<String, String> = HashMap::new();
    let mut basis_order: Vec<String> = Vec::new();

    for path in &inputs {
        let content = fs::read_to_string(path).map_err(|e| format!("FireFly error: {e}"))?;
        collect_terms(&content, &families, &skip, &mut coefficients, &mut basis_order)
            .map_err(|e| format!("FireFly error: {e} in '{}'", path.display()))?;
    }

    if basis_order.is_empty() {
        return Err("FireFly error: no basis functions found in the input".to_string());
    }

    info!(
        "FireFly info: found {} basis function(s) over {} variable(s)",
        basis_order.len(),
        vars.len()
    );

    if cli.nointerpolation {
        return write_unsimplified(&coefficients, &basis_order, &families);
    }

    // Parse all coefficient expressions.
    let mut expressions = Vec::with_capacity(basis_order.len());
    for basis in &basis_order {
        let expr = ParsedExpression::parse(&coefficients[basis], &vars)
            .map_err(|e| format!("FireFly error: {e} for '{basis}'"))?;
        expressions.push(RwLock::new(expr));
    }

    let bb = ExpressionBlackBox { expressions };

    let mut reconstructor =
        Reconstructor::with_bunch_size(vars.len(), cli.parallel.max(1), cli.bunchsize, bb);

    if !cli.nofactorscan && vars.len() > 1 {
        reconstructor.enable_factor_scan();
    }
    if cli.factorscan {
        reconstructor.enable_factor_scan();
        reconstructor.stop_after_factor_scan();
        reconstructor.set_tags(basis_order.clone());
        reconstructor
            .reconstruct(firefly_core::primes::NUM_PRIMES)
            .map_err(|e| e.to_string())?;
        return Ok(());
    }
    if cli.save {
        reconstructor.set_tags(basis_order.clone());
    }
    if vars.len() > 1 {
        reconstructor.enable_shift_scan();
    }

    if cli.save && Path::new("ff_save/states").is_dir() {
        match reconstructor.resume_from_saved_state() {
            Ok(()) => info!("FireFly info: resuming from saved state"),
            Err(e) => return Err(e.to_string()),
        }
    }

    reconstructor
        .reconstruct(firefly_core::primes::NUM_PRIMES)
        .map_err(|e| e.to_string())?;

    let results = reconstructor.get_result();
    info!("FireFly info: probes in total: {}", reconstructor.probes_fed());

    write_results(&basis_order, &results, &vars, &families)
}

/// Read a config file: one entry per line, '#' comments.
fn read_config_list(path: &str) -> Result<Vec<String>, std::io::Error> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(|line| line.trim().replace(' ', ""))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect())
}

/// Split an expression into top-level terms and collect the coefficient of
/// every basis-function reference.
fn collect_terms(
    content: &str,
    families: &[String],
    skip: &HashSet<String>,
    coefficients: &mut HashMap<String, String>,
    basis_order: &mut Vec<String>,
) -> Result<(), String> {
    let text: String = content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");

    for (sign, term) in split_top_level_terms(&text) {
        let term = term.trim();
        if term.is_empty() {
            continue;
        }

        let (basis, coefficient) = extract_basis(term, families)
            .ok_or_else(|| format!("term '{term}' references no known basis function"))?;

        let family = basis.split('[').next().unwrap_or(&basis).to_string();
        if skip.contains(&family) || skip.contains(&basis) {
            continue;
        }

        let signed = if sign < 0 {
            format!("-({coefficient})")
        } else {
            format!("({coefficient})")
        };

        match coefficients.get_mut(&basis) {
            Some(existing) => {
                existing.push('+');
                existing.push_str(&signed);
            }
            None => {
                coefficients.insert(basis.clone(), signed);
                basis_order.push(basis);
            }
        }
    }

    Ok(())
}

/// Split on `+` and `-` outside of parentheses and brackets.
fn split_top_level_terms(text: &str) -> Vec<(i32, String)> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut sign = 1;

    for c in text.chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(c);
            }
            '+' | '-' if depth == 0 && !current.trim().is_empty() => {
                terms.push((sign, std::mem::take(&mut current)));
                sign = if c == '-' { -1 } else { 1 };
            }
            '-' if depth == 0 => {
                sign = -sign;
            }
            '+' if depth == 0 => {}
            _ => current.push(c),
        }
    }

    if !current.trim().is_empty() {
        terms.push((sign, current));
    }

    terms
}

/// Find the basis-function reference (`fam` or `fam[..]`) in a term and
/// return it together with the remaining coefficient expression.
fn extract_basis(term: &str, families: &[String]) -> Option<(String, String)> {
    for family in families {
        let mut search_from = 0;
        while let Some(rel) = term[search_from..].find(family.as_str()) {
            let start = search_from + rel;
            let end = start + family.len();

            // must be a full identifier
            let before_ok = start == 0
                || !term[..start]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_');
            let after = term[end..].chars().next();
            let after_ok = !after.is_some_and(|c| c.is_alphanumeric() || c == '_');

            if !(before_ok && after_ok) {
                search_from = end;
                continue;
            }

            // optional argument bracket
            let mut basis_end = end;
            if after == Some('[') {
                let mut depth = 0;
                for (i, c) in term[end..].char_indices() {
                    match c {
                        '[' => depth += 1,
                        ']' => {
                            depth -= 1;
                            if depth == 0 {
                                basis_end = end + i + 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }

            let basis = term[start..basis_end].to_string();

            // Remove the reference; what is left is the coefficient.
            let coefficient = format!("{} 1 {}", &term[..start], &term[basis_end..]);
            let mut coefficient = coefficient
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            // Tidy dangling multiplication signs around the removed basis.
            coefficient = coefficient
                .replace("* 1 *", "*")
                .replace("* 1", "")
                .replace("1 *", "")
                .trim()
                .to_string();
            if coefficient.is_empty() || coefficient == "1" {
                coefficient = "1".to_string();
            }

            return Some((basis, coefficient));
        }
    }

    None
}

fn output_file_name(family: &str) -> String {
    format!("out_{family}")
}

/// Write the reconstructed coefficients, one file per family.
fn write_results(
    basis_order: &[String],
    results: &[firefly_core::RationalFunction],
    vars: &[String],
    families: &[String],
) -> Result<(), String> {
    let var_refs: Vec<&str> = vars.iter().map(|s| s.as_str()).collect();

    let mut per_family: HashMap<String, Vec<String>> = HashMap::new();

    for (basis, result) in basis_order.iter().zip(results.iter()) {
        let family = basis.split('[').next().unwrap_or(basis).to_string();
        per_family
            .entry(family)
            .or_default()
            .push(format!("+ {basis}*{}", result.to_string_with_vars(&var_refs)));
    }

    for family in families {
        let Some(lines) = per_family.get(family) else {
            continue;
        };

        let path = output_file_name(family);
        let mut content = String::from("{\n");
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        content.push_str("}\n");

        fs::write(&path, content).map_err(|e| format!("FireFly error: {e}"))?;
        info!("FireFly info: wrote {path}");
    }

    Ok(())
}

/// `-ni`: dump the collected coefficient expressions without interpolation.
fn write_unsimplified(
    coefficients: &HashMap<String, String>,
    basis_order: &[String],
    families: &[String],
) -> Result<(), String> {
    let mut per_family: HashMap<String, Vec<String>> = HashMap::new();

    for basis in basis_order {
        let family = basis.split('[').next().unwrap_or(basis).to_string();
        per_family
            .entry(family)
            .or_default()
            .push(format!("+ {basis}*({})", coefficients[basis]));
    }

    for family in families {
        let Some(lines) = per_family.get(family) else {
            continue;
        };

        let path = output_file_name(family);
        let mut content = String::from("{\n");
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        content.push_str("}\n");

        fs::write(&path, content).map_err(|e| format!("FireFly error: {e}"))?;
    }

    Ok(())
}

/// `-m`: merge a directory of result fragments into one file per family.
fn merge_results(dir: &Path) -> Result<(), String> {
    if !dir.is_dir() {
        return Err(format!(
            "FireFly error: '{}' is not a directory",
            dir.display()
        ));
    }

    let mut per_family: HashMap<String, Vec<String>> = HashMap::new();

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| format!("FireFly error: {e}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("out_"))
        })
        .collect();
    paths.sort();

    for path in &paths {
        let family = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("out_"))
            .unwrap_or_default()
            .to_string();

        let content = fs::read_to_string(path).map_err(|e| format!("FireFly error: {e}"))?;
        let lines = per_family.entry(family).or_default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line == "{" || line == "}" {
                continue;
            }
            lines.push(line.to_string());
        }
    }

    for (family, lines) in &per_family {
        let path = output_file_name(family);
        let mut content = String::from("{\n");
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        content.push_str("}\n");
        fs::write(&path, content).map_err(|e| format!("FireFly error: {e}"))?;
        info!("FireFly info: merged {path}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_top_level_terms() {
        let terms = split_top_level_terms("a*fam[1] + (b - c)*fam[2] - d*fam[1]");
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0].0, 1);
        assert_eq!(terms[1].0, 1);
        assert!(terms[1].1.contains("(b - c)"));
        assert_eq!(terms[2].0, -1);
    }

    #[test]
    fn test_extract_basis() {
        let families = vec!["fam".to_string()];

        let (basis, coefficient) = extract_basis("2*x*fam[1,0,2]", &families).unwrap();
        assert_eq!(basis, "fam[1,0,2]");
        assert!(coefficient.contains("2*x"));

        let (basis, coefficient) = extract_basis("fam[1]", &families).unwrap();
        assert_eq!(basis, "fam[1]");
        assert_eq!(coefficient, "1");

        assert!(extract_basis("2*x*other[1]", &families).is_none());

        // 'famx' must not match the family 'fam'
        assert!(extract_basis("famx*3", &families).is_none());
    }

    #[test]
    fn test_collect_terms() {
        let families = vec!["fam".to_string()];
        let skip = HashSet::new();
        let mut coefficients = HashMap::new();
        let mut order = Vec::new();

        collect_terms(
            "x*fam[1] + y*fam[2] - 3*fam[1]",
            &families,
            &skip,
            &mut coefficients,
            &mut order,
        )
        .unwrap();

        assert_eq!(order, vec!["fam[1]", "fam[2]"]);
        assert!(coefficients["fam[1]"].contains("-("));
        assert!(coefficients["fam[2]"].contains('y'));
    }

    #[test]
    fn test_read_config_missing() {
        assert!(read_config_list("definitely/not/here").is_err());
    }
}

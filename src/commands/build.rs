use anyhow::{Context, Result};
use clap::Parser;
use std::{
    fs,
    io::Read,
    path::PathBuf,
};
use treesnap_core::{hash_bytes, hash_file, walk, Digest, MerkleTree};

/// Build a Merkle tree from data blocks or files, and optionally
/// generate and verify an inclusion proof against the root.
///
/// Data blocks come from positional arguments, `--input-file` (one block
/// per line), or stdin when neither is given. `--directory` switches to
/// file mode: every regular file under the directory becomes a leaf,
/// hashed by content, in deterministic path order.
#[derive(Parser)]
#[clap(bin_name = "treesnap", version)]
pub struct BuildCommand {
    /// Data blocks to include as leaves, in order.
    #[clap(value_name = "DATA")]
    pub data: Vec<String>,

    /// Read data blocks from a file, one per line.
    #[clap(long, value_name = "PATH", conflicts_with = "data")]
    pub input_file: Option<PathBuf>,

    /// Build from the regular files under a directory.
    #[clap(long, value_name = "DIR", conflicts_with_all = ["data", "input_file"])]
    pub directory: Option<PathBuf>,

    /// Write the tree JSON to a file instead of stdout.
    #[clap(long, value_name = "PATH")]
    pub output_file: Option<PathBuf>,

    /// Pretty-print the tree JSON.
    #[clap(long)]
    pub pretty: bool,

    /// Generate and verify an inclusion proof for the given data block
    /// (or file path, in directory mode).
    #[clap(long, value_name = "DATA")]
    pub verify: Option<String>,
}

impl BuildCommand {
    /// Executes the command.
    pub fn exec(self) -> Result<()> {
        let tree = self.build_tree()?;

        let body = tree.to_body();
        let json = if self.pretty {
            serde_json::to_string_pretty(&body)?
        } else {
            serde_json::to_string(&body)?
        };

        match &self.output_file {
            Some(path) => {
                fs::write(path, &json)
                    .with_context(|| format!("failed to write `{}`", path.display()))?;
            }
            None => println!("{json}"),
        }
        println!("Merkle Root: {}", tree.root_hash());

        if let Some(target) = &self.verify {
            let leaf = self.target_hash(target)?;
            let proof = tree.prove(&leaf)?;
            println!("{}", serde_json::to_string_pretty(&proof)?);

            if proof.verify(&leaf, tree.root_hash()) {
                println!("VALID");
            } else {
                println!("INVALID");
            }
        }

        Ok(())
    }

    fn build_tree(&self) -> Result<MerkleTree> {
        if let Some(dir) = &self.directory {
            let files = walk::walk(dir)?;
            return Ok(MerkleTree::from_files(files)?);
        }

        let blocks = if let Some(path) = &self.input_file {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read `{}`", path.display()))?;
            lines_to_blocks(&raw)
        } else if !self.data.is_empty() {
            self.data.clone()
        } else {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read data blocks from stdin")?;
            lines_to_blocks(&raw)
        };

        Ok(MerkleTree::from_data(blocks)?)
    }

    /// In directory mode the verify target is a file path; otherwise it
    /// is a raw data block.
    fn target_hash(&self, target: &str) -> Result<Digest> {
        if self.directory.is_some() {
            Ok(hash_file(target)?)
        } else {
            Ok(hash_bytes(target))
        }
    }
}

fn lines_to_blocks(raw: &str) -> Vec<String> {
    raw.lines()
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> BuildCommand {
        BuildCommand::try_parse_from(
            std::iter::once("treesnap").chain(args.iter().copied()),
        )
        .unwrap()
    }

    #[test]
    fn builds_from_positional_blocks() {
        let cmd = command(&["a", "b"]);
        let tree = cmd.build_tree().unwrap();
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn builds_from_an_input_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "a\nb\n\nc").unwrap();

        let cmd = command(&["--input-file", file.path().to_str().unwrap()]);
        let tree = cmd.build_tree().unwrap();
        // The blank line is skipped.
        assert_eq!(tree.leaf_count(), 3);

        let expected = MerkleTree::from_data(["a", "b", "c"]).unwrap();
        assert_eq!(tree.root_hash(), expected.root_hash());
    }

    #[test]
    fn builds_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), "x").unwrap();
        fs::write(dir.path().join("y.txt"), "y").unwrap();

        let cmd = command(&["--directory", dir.path().to_str().unwrap()]);
        let tree = cmd.build_tree().unwrap();
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(
            tree.root_hash(),
            MerkleTree::from_data(["x", "y"]).unwrap().root_hash()
        );
    }

    #[test]
    fn verify_target_matches_the_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        fs::write(&path, "x").unwrap();

        let data_cmd = command(&["x"]);
        let file_cmd = command(&["--directory", dir.path().to_str().unwrap()]);

        assert_eq!(data_cmd.target_hash("x").unwrap(), hash_bytes("x"));
        assert_eq!(
            file_cmd.target_hash(path.to_str().unwrap()).unwrap(),
            hash_bytes("x")
        );
    }

    #[test]
    fn proof_of_a_block_verifies_end_to_end() {
        let cmd = command(&["a", "b", "c", "--verify", "c"]);
        let tree = cmd.build_tree().unwrap();
        let leaf = cmd.target_hash("c").unwrap();
        let proof = tree.prove(&leaf).unwrap();
        assert!(proof.verify(&leaf, tree.root_hash()));
    }

    #[test]
    fn unknown_verify_target_fails() {
        let cmd = command(&["a", "b"]);
        let tree = cmd.build_tree().unwrap();
        let leaf = cmd.target_hash("zzz").unwrap();
        assert!(tree.prove(&leaf).is_err());
    }
}

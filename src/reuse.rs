//! Persisted compression parameters.
//!
//! A reuse file records the two model lists, the hunk order and the
//! hash-table size of a finished link, so a later run can reproduce
//! the result or use it as the bound to beat. The format is a plain
//! text file; loading a saved file and saving it again produces the
//! identical bytes.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::Error;
use crate::hunklist::HunkList;
use crate::modellist::{Model, ModelList4k};

/// How the reuse file participates in a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseType {
    Off,
    /// Record the result of this link.
    Write,
    /// Reproduce the recorded parameters exactly.
    Stable,
    /// Try to beat the recorded parameters, keep whichever wins.
    Improve,
}

const MAGIC_LINE: &str = "pepack reuse file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reuse {
    code_models: ModelList4k,
    data_models: ModelList4k,
    hunk_order: Vec<String>,
    hash_size: u32,
}

fn format_models(models: &ModelList4k) -> String {
    models
        .models()
        .iter()
        .map(|m| format!("{:02x}:{}", m.mask, m.weight))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_models(line: &str, lineno: usize) -> Result<ModelList4k, Error> {
    let mut models = ModelList4k::new();
    if line.trim().is_empty() {
        return Ok(models);
    }
    for part in line.split(',') {
        let (mask, weight) = part.split_once(':').ok_or(Error::ReuseFormat {
            line: lineno,
            message: format!("bad model '{}'", part),
        })?;
        let mask = u8::from_str_radix(mask, 16).map_err(|_| Error::ReuseFormat {
            line: lineno,
            message: format!("bad model mask '{}'", mask),
        })?;
        let weight = weight.parse().map_err(|_| Error::ReuseFormat {
            line: lineno,
            message: format!("bad model weight '{}'", weight),
        })?;
        models.push(Model { weight, mask });
    }
    Ok(models)
}

impl Reuse {
    pub fn new(
        code_models: &ModelList4k,
        data_models: &ModelList4k,
        pool: &HunkList,
        hash_size: u32,
    ) -> Self {
        Self {
            code_models: code_models.clone(),
            data_models: data_models.clone(),
            hunk_order: pool.iter().map(|h| h.name().to_string()).collect(),
            hash_size,
        }
    }

    #[doc(hidden)]
    pub fn for_test(hunk_order: Vec<String>) -> Self {
        Self {
            code_models: ModelList4k::new(),
            data_models: ModelList4k::new(),
            hunk_order,
            hash_size: 0,
        }
    }

    pub fn code_models(&self) -> &ModelList4k {
        &self.code_models
    }

    pub fn data_models(&self) -> &ModelList4k {
        &self.data_models
    }

    pub fn hunk_order(&self) -> &[String] {
        &self.hunk_order
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    /// Canonical text form; `parse` inverts it exactly.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str(MAGIC_LINE);
        text.push('\n');
        text.push_str(&format!("hashsize {}\n", self.hash_size));
        text.push_str(&format!("codemodels {}\n", format_models(&self.code_models)));
        text.push_str(&format!("datamodels {}\n", format_models(&self.data_models)));
        for name in &self.hunk_order {
            text.push_str(&format!("hunk {}\n", name));
        }
        text
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut lines = text.lines().enumerate();
        match lines.next() {
            Some((_, line)) if line == MAGIC_LINE => {}
            _ => {
                return Err(Error::ReuseFormat { line: 1, message: "missing signature".into() });
            }
        }
        let mut hash_size = None;
        let mut code_models = None;
        let mut data_models = None;
        let mut hunk_order = Vec::new();
        for (i, line) in lines {
            let lineno = i + 1;
            let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
            match keyword {
                "hashsize" => {
                    hash_size = Some(rest.parse().map_err(|_| Error::ReuseFormat {
                        line: lineno,
                        message: format!("bad hash size '{}'", rest),
                    })?);
                }
                "codemodels" => code_models = Some(parse_models(rest, lineno)?),
                "datamodels" => data_models = Some(parse_models(rest, lineno)?),
                "hunk" => hunk_order.push(rest.to_string()),
                "" => {}
                other => {
                    return Err(Error::ReuseFormat {
                        line: lineno,
                        message: format!("unknown keyword '{}'", other),
                    });
                }
            }
        }
        Ok(Self {
            code_models: code_models.unwrap_or_else(ModelList4k::new),
            data_models: data_models.unwrap_or_else(ModelList4k::new),
            hunk_order,
            hash_size: hash_size.ok_or(Error::ReuseFormat {
                line: 1,
                message: "missing hash size".into(),
            })?,
        })
    }

    /// Loads a reuse file; a missing file is not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>, Error> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Self::parse(&text).map(Some)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modelsearch::instant_models_4k;

    fn sample() -> Reuse {
        let mut data_models = ModelList4k::new();
        data_models.push(Model { weight: 2, mask: 0x0f });
        Reuse {
            code_models: instant_models_4k(),
            data_models,
            hunk_order: vec!["import".into(), "code a".into(), "data".into()],
            hash_size: 65522,
        }
    }

    #[test]
    fn test_text_roundtrip() {
        let reuse = sample();
        let text = reuse.to_text();
        let parsed = Reuse::parse(&text).unwrap();
        assert_eq!(parsed, reuse);
        // Byte-identical through a load/save cycle.
        assert_eq!(parsed.to_text(), text);
    }

    #[test]
    fn test_hunk_names_with_spaces_survive() {
        let reuse = sample();
        let parsed = Reuse::parse(&reuse.to_text()).unwrap();
        assert_eq!(parsed.hunk_order()[1], "code a");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        match Reuse::parse("not a reuse file\n") {
            Err(Error::ReuseFormat { line: 1, .. }) => (),
            other => panic!("{:?}", other),
        }
        match Reuse::parse("pepack reuse file\nbogus keyword\n") {
            Err(Error::ReuseFormat { line: 2, .. }) => (),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_empty_model_list() {
        let reuse = Reuse::for_test(vec!["only".into()]);
        let parsed = Reuse::parse(&reuse.to_text()).unwrap();
        assert_eq!(parsed.code_models().len(), 0);
        assert_eq!(parsed.hunk_order(), ["only"]);
    }
}

use std::path::{Path, PathBuf};

/// Dataset and output locations for one run. Passed explicitly everywhere;
/// there is no process-wide path configuration.
#[derive(Debug, Clone)]
pub struct Paths {
    pub train_dir: PathBuf,
    pub val_dir: PathBuf,
    pub test_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Paths {
    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.output_dir.join("models")
    }

    pub fn visualizations_dir(&self) -> PathBuf {
        self.output_dir.join("visualizations")
    }
}

/// Reference plates of an evaluation split live in `plates/`, labeled query
/// photos in `queries/<plate_index>/`.
pub fn plates_dir(split: &Path) -> PathBuf {
    split.join("plates")
}

pub fn queries_dir(split: &Path) -> PathBuf {
    split.join("queries")
}

pub fn parse_image_size(raw: &str) -> anyhow::Result<u32> {
    let size: u32 = raw
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Provide a correct image size"))?;
    if size < 224 {
        anyhow::bail!("Image size should be bigger than 224");
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_224_is_accepted() {
        assert_eq!(parse_image_size("224").unwrap(), 224);
        assert_eq!(parse_image_size("1024").unwrap(), 1024);
    }

    #[test]
    fn image_size_below_224_is_rejected() {
        let err = parse_image_size("223").unwrap_err();
        assert_eq!(err.to_string(), "Image size should be bigger than 224");
    }

    #[test]
    fn non_numeric_image_size_is_rejected() {
        let err = parse_image_size("abc").unwrap_err();
        assert_eq!(err.to_string(), "Provide a correct image size");
    }

    #[test]
    fn split_subdirectories() {
        let split = Path::new("data/val");
        assert_eq!(plates_dir(split), Path::new("data/val/plates"));
        assert_eq!(queries_dir(split), Path::new("data/val/queries"));
    }
}

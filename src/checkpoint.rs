use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use burn::{
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};
use tracing::info;

use crate::error::{CrnnError, Result};

pub const CHECKPOINT_NAME: &str = "netRCNN";
const EXTENSION: &str = "bin";

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

/// Path of the checkpoint written into `dir`.
pub fn checkpoint_path<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(format!("{CHECKPOINT_NAME}.{EXTENSION}"))
}

/// Records `model` into `dir`. The parameters are written and synced under a
/// hidden name first, then renamed over `netRCNN.bin`.
pub fn save<B: Backend, M: Module<B>, P: AsRef<Path>>(model: &M, dir: P) -> Result<PathBuf> {
    let dir = dir.as_ref();
    let final_path = checkpoint_path(dir);
    fs::create_dir_all(dir).map_err(|err| CrnnError::checkpoint(dir, err))?;

    // the recorder appends its own extension
    let partial_stem = dir.join(format!(".{CHECKPOINT_NAME}"));
    let partial_path = dir.join(format!(".{CHECKPOINT_NAME}.{EXTENSION}"));

    let written = model
        .clone()
        .save_file(partial_stem, &recorder())
        .map_err(|err| CrnnError::checkpoint(&partial_path, format!("{err:?}")))
        .and_then(|_| {
            File::open(&partial_path)
                .and_then(|file| file.sync_all())
                .map_err(|err| CrnnError::checkpoint(&partial_path, err))
        })
        .and_then(|_| {
            fs::rename(&partial_path, &final_path)
                .map_err(|err| CrnnError::checkpoint(&final_path, err))
        });
    if let Err(err) = written {
        if partial_path.exists() {
            let _ = fs::remove_file(&partial_path);
        }
        return Err(err);
    }

    info!(path = %final_path.display(), "checkpoint saved");
    Ok(final_path)
}

/// Restores the parameters of `model` from a checkpoint file.
pub fn load<B: Backend, M: Module<B>, P: AsRef<Path>>(
    model: M,
    path: P,
    device: &B::Device,
) -> Result<M> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(CrnnError::checkpoint(path, "file does not exist"));
    }

    let model = model
        .load_file(path.to_path_buf(), &recorder(), device)
        .map_err(|err| CrnnError::checkpoint(path, format!("{err:?}")))?;

    info!(path = %path.display(), "checkpoint loaded");
    Ok(model)
}

#[cfg(test)]
mod test {
    use burn::{
        backend::NdArray,
        nn::{Linear, LinearConfig},
        tensor::{Distribution, Tensor},
    };

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn test_save_then_load_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);

        let path = save(&model, dir.path()).unwrap();
        assert_eq!(path, checkpoint_path(dir.path()));
        assert_eq!(path.file_name().unwrap(), "netRCNN.bin");
        // no partial file is left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let fresh: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let restored = load(fresh, &path, &device).unwrap();

        let input = Tensor::<TestBackend, 2>::random([2, 4], Distribution::Default, &device);
        let expected = model.forward(input.clone()).into_data().value;
        let actual = restored.forward(input).into_data().value;
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_failed_save_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);

        // a non-empty directory cannot be replaced by the rename
        let blocker = checkpoint_path(dir.path());
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        let err = save(&model, dir.path()).unwrap_err();
        assert!(matches!(err, CrnnError::CheckpointIo { .. }));

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![blocker.file_name().unwrap().to_os_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);

        let err = load(model, dir.path().join("nope.bin"), &device).unwrap_err();
        assert!(matches!(err, CrnnError::CheckpointIo { .. }));
    }
}

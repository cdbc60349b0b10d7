use std::io::prelude::*;
use std::path::Path;

use crate::error::PackageError;
use crate::protocol::ImageType;

/// Firmware bytes and the component they replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    image_type: ImageType,
}

impl FirmwareImage {
    /// An unspecified image type ([`ImageType::None`]) is taken as an application.
    pub fn new(data: Vec<u8>, image_type: ImageType) -> Result<Self, PackageError> {
        if u32::try_from(data.len()).is_err() {
            return Err(PackageError::TooLarge(data.len()));
        }
        let image_type = match image_type {
            ImageType::None => ImageType::Application,
            other => other,
        };
        Ok(FirmwareImage { data, image_type })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length as announced to the bootloader; `new` guarantees it fits.
    pub fn len_u32(&self) -> u32 {
        self.data.len() as u32
    }

    /// Load a `.zip` DFU package, or any other file as a raw binary of `image_type`.
    pub fn load(path: &Path, image_type: ImageType) -> Result<Self, PackageError> {
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if is_zip {
            Self::from_package(std::fs::File::open(path)?)
        } else {
            Self::new(std::fs::read(path)?, image_type)
        }
    }

    /// Read a legacy nrfutil package. Its `manifest.json` decides the image type.
    pub fn from_package<R: Read + Seek>(reader: R) -> Result<Self, PackageError> {
        let mut zip = zip::ZipArchive::new(reader)?;

        let manifest_raw = zip.by_name("manifest.json")?;
        let manifest: serde_json::Value = serde_json::from_reader(manifest_raw)?;
        let (image_type, bin_name) = select_image(&manifest)?;

        let mut bin = Vec::new();
        zip.by_name(&bin_name)?.read_to_end(&mut bin)?;
        tracing::debug!(?image_type, file = %bin_name, len = bin.len(), "Loaded package image");

        Self::new(bin, image_type)
    }
}

fn select_image(manifest: &serde_json::Value) -> Result<(ImageType, String), PackageError> {
    let manifest = &manifest["manifest"];
    if !manifest.is_object() {
        return Err(PackageError::InvalidManifest("missing \"manifest\" object".into()));
    }
    if manifest["softdevice_bootloader"].is_object() {
        return Err(PackageError::Unsupported(
            "combined softdevice and bootloader images".into(),
        ));
    }

    let candidates = [
        ("application", ImageType::Application),
        ("bootloader", ImageType::Bootloader),
        ("softdevice", ImageType::SoftDevice),
    ];
    let mut present = candidates.iter().filter(|(key, _)| manifest[*key].is_object());
    let (key, image_type) = match (present.next(), present.next()) {
        (Some(found), None) => *found,
        (None, _) => return Err(PackageError::InvalidManifest("no firmware image listed".into())),
        (Some(_), Some(_)) => {
            return Err(PackageError::Unsupported("packages with more than one image".into()))
        }
    };

    let bin_name = manifest[key]["bin_file"]
        .as_str()
        .ok_or_else(|| PackageError::InvalidManifest(format!("{} has no bin_file", key)))?;
    Ok((image_type, bin_name.to_string()))
}

//! OCI image support for A3S Bake.
//!
//! Reading and writing OCI image layouts, the local image store, registry
//! pull/push and layer construction.
//!
//! # Layout
//!
//! ```text
//! image/
//! ├── oci-layout           (OCI layout marker)
//! ├── index.json           (Image index)
//! └── blobs/
//!     └── sha256/
//!         ├── <manifest>   (Image manifest)
//!         ├── <config>     (Image configuration)
//!         └── <layers>     (Filesystem layers)
//! ```

pub(crate) mod image;
pub mod layer;
mod pull;
pub mod reference;
pub mod registry;
pub mod store;

pub use image::{
    blob_path, LayerBlob, OciImage, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
    OCI_LAYOUT_MARKER,
};
pub use layer::{create_layer_from_dir, create_layer_from_entries, LayerInfo};
pub use pull::ImagePuller;
pub use reference::{Destination, ImageReference};
pub use registry::{host_architecture, PushResult, RegistryPuller, RegistryPusher};
pub use store::{ImageStore, StoredImage};

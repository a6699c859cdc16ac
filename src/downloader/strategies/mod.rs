pub mod direct_downloader;
pub mod render_downloader;
pub mod sidecars;

pub use direct_downloader::DirectDownloader;
pub use render_downloader::RenderDownloader;
pub use sidecars::Sidecars;

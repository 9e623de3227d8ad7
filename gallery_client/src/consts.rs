pub const BASE_URL: &str = "https://e-hentai.org";

pub mod gallery {
    use lazy_static::lazy_static;
    use scraper::Selector;

    lazy_static! {
        pub static ref IMAGE_COUNT: Selector =
            Selector::parse("#gdd tr:nth-child(6) > td:last-child").unwrap();
        pub static ref PREVIEW_PAGE_COUNT: Selector =
            Selector::parse("table.ptt td:nth-last-child(2) > a").unwrap();
        pub static ref PREVIEWS: Selector = Selector::parse("#gdt > a").unwrap();
    }
}

pub mod image {
    use lazy_static::lazy_static;
    use scraper::Selector;

    lazy_static! {
        pub static ref URL: Selector = Selector::parse("#i3 img").unwrap();
        pub static ref LOAD_FAIL: Selector = Selector::parse("#loadfail").unwrap();
    }
}

use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;

static BAR_STYLE: Lazy<ProgressStyle> = Lazy::new(|| {
    ProgressStyle::with_template("{msg}: [{bar:40.green}] {pos}/{len} ({eta})")
        .expect("static progress template")
        .progress_chars("=> ")
});

/// Iterator adapter that drives an indicatif bar as it is consumed.
pub struct NiceProgressBar<I> {
    inner: I,
    bar: ProgressBar,
}

impl<I: ExactSizeIterator> NiceProgressBar<I> {
    pub fn new(inner: I, message: &'static str) -> Self {
        let bar = ProgressBar::new(inner.len() as u64);
        bar.set_style(BAR_STYLE.clone());
        bar.set_message(message);
        Self { inner, bar }
    }
}

impl<I: Iterator> Iterator for NiceProgressBar<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(item) => {
                self.bar.inc(1);
                Some(item)
            }
            None => {
                self.bar.finish_and_clear();
                None
            }
        }
    }
}

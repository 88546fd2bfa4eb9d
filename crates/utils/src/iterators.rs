/// Given an iterator that's clonable, split it into two iterators
/// at a given maximum number of elements.
pub fn iterator_split<I>(
    it: I,
    max: usize,
) -> (impl Iterator<Item = I::Item>, impl Iterator<Item = I::Item>)
where
    I: Iterator + Clone,
{
    let rest = it.clone();
    (it.take(max), rest.skip(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_it_split() {
        let none: &[&str] = &[];
        for v in [0, 1, 8] {
            let (kept, dropped) = iterator_split(none.iter(), v);
            assert_eq!(kept.count(), 0);
            assert_eq!(dropped.count(), 0);
        }
        let disks = ["/dev/sda", "/dev/sdb", "/dev/sdc"];
        let (kept, dropped) = iterator_split(disks.iter(), 8);
        assert_eq!(kept.count(), 3);
        assert_eq!(dropped.count(), 0);
        let (kept, dropped) = iterator_split(disks.iter(), 2);
        assert_eq!(kept.collect::<Vec<_>>(), [&"/dev/sda", &"/dev/sdb"]);
        assert_eq!(dropped.collect::<Vec<_>>(), [&"/dev/sdc"]);
    }
}

use tagalloc::Tagalloc;

fn print_alloc(pointer: *mut u8, size: usize, alignment: usize) {
    println!("\nAlloc of size {size} and alignment {alignment} at {pointer:?}");
    println!(
        "Alignment check: {pointer:?} % {alignment} = {}",
        pointer as usize % alignment
    );
}

fn main() {
    let allocator = Tagalloc::new();

    unsafe {
        let first = allocator.allocate_aligned(16, 1);
        print_alloc(first, 1, 16);

        let second = allocator.allocate_aligned(32, 1);
        print_alloc(second, 1, 32);

        let third = allocator.allocate_aligned(1024, 1);
        print_alloc(third, 1, 1024);

        let paged = allocator.allocate_page_aligned(100);
        print_alloc(paged, 100, 4096);

        allocator.free(first);
        allocator.free(second);
        allocator.free(third);
        allocator.free(paged);
    }
}

//! # Table Engine Tests
//!
//! End-to-end coverage of the columnar table surface: schema building, row
//! and cell operations, nested subtables, the string-enum conversion pass,
//! and the structural invariants that must hold after every public
//! operation (size uniformity, ref consistency, JSON round-trip stability).

use stratadb::{Alloc, ColumnKind, MixedValue, Table};

fn people_table(alloc: &Alloc) -> Table {
    let mut t = Table::new(alloc);
    t.add_column(ColumnKind::Int, "x").unwrap();
    t.add_column(ColumnKind::String, "name").unwrap();

    t.add_row().unwrap();
    t.add_row().unwrap();
    t.set_int(0, 0, 42).unwrap();
    t.set_string(1, 0, "ada").unwrap();
    t.set_int(0, 1, 7).unwrap();
    t.set_string(1, 1, "ada").unwrap();
    t
}

mod basic_tables {
    use super::*;

    #[test]
    fn ints_and_strings_round_trip() {
        let alloc = Alloc::new();
        let t = people_table(&alloc);

        assert_eq!(t.size(), 2);
        assert_eq!(t.column_count(), 2);
        assert_eq!(t.column_name(1).unwrap(), "name");
        assert_eq!(t.column_index("x"), Some(0));
        assert_eq!(t.get_int(0, 0).unwrap(), 42);
        assert_eq!(t.get_string(1, 1).unwrap(), "ada");

        assert_eq!(
            t.to_json().unwrap(),
            r#"[{"x":42,"name":"ada"},{"x":7,"name":"ada"}]"#
        );
        assert_eq!(t.find_string(1, "ada").unwrap(), Some(0));
        assert_eq!(t.find(0, 42).unwrap(), Some(0));
        t.verify().unwrap();
    }

    #[test]
    fn wrong_type_operations_are_refused() {
        let alloc = Alloc::new();
        let mut t = people_table(&alloc);

        assert!(t.get_string(0, 0).is_err());
        assert!(t.set_int(1, 0, 1).is_err());
        assert!(t.get_bool(0, 0).is_err(), "int column is not bool");
        assert!(t.get_int(0, 5).is_err(), "row out of bounds");
        assert!(t.get_int(9, 0).is_err(), "column out of bounds");
        t.verify().unwrap();
    }

    #[test]
    fn delete_and_clear_keep_columns_uniform() {
        let alloc = Alloc::new();
        let mut t = people_table(&alloc);

        t.delete_row(0).unwrap();
        assert_eq!(t.size(), 1);
        assert_eq!(t.get_int(0, 0).unwrap(), 7);
        t.verify().unwrap();

        t.clear().unwrap();
        assert_eq!(t.size(), 0);
        assert_eq!(t.to_json().unwrap(), "[]");
        t.verify().unwrap();
    }

    #[test]
    fn insert_done_closes_a_row_batch() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Int, "a").unwrap();
        t.add_column(ColumnKind::String, "b").unwrap();

        t.insert_int(0, 0, 10).unwrap();
        t.insert_string(1, 0, "first").unwrap();
        t.insert_done().unwrap();
        t.insert_int(0, 0, 20).unwrap();
        t.insert_string(1, 0, "second").unwrap();
        t.insert_done().unwrap();

        assert_eq!(t.size(), 2);
        assert_eq!(t.get_int(0, 0).unwrap(), 20);
        assert_eq!(t.get_string(1, 1).unwrap(), "first");
        t.verify().unwrap();
    }

    #[test]
    fn adding_a_column_backfills_existing_rows() {
        let alloc = Alloc::new();
        let mut t = people_table(&alloc);
        t.add_column(ColumnKind::Bool, "flag").unwrap();

        assert_eq!(t.size(), 2);
        assert!(!t.get_bool(2, 0).unwrap());
        t.set_bool(2, 1, true).unwrap();
        assert!(t.get_bool(2, 1).unwrap());
        t.verify().unwrap();
    }

    #[test]
    fn dates_bools_and_binary_render_in_json() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Bool, "ok").unwrap();
        t.add_column(ColumnKind::Date, "at").unwrap();
        t.add_column(ColumnKind::Binary, "blob").unwrap();

        t.add_row().unwrap();
        t.set_bool(0, 0, true).unwrap();
        t.set_date(1, 0, 951_827_445).unwrap(); // 2000-02-29 12:30:45 UTC
        t.set_binary(2, 0, &[0xde, 0xad, 0x00]).unwrap();

        assert_eq!(
            t.to_json().unwrap(),
            r#"[{"ok":true,"at":"2000-02-29 12:30:45","blob":"dead00"}]"#
        );
        assert_eq!(t.find_bool(0, true).unwrap(), Some(0));
        assert_eq!(t.find_date(1, 951_827_445).unwrap(), Some(0));
        assert_eq!(t.get_binary(2, 0).unwrap(), vec![0xde, 0xad, 0x00]);
    }

    #[test]
    fn hamming_search_through_the_table() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Int, "bits").unwrap();
        for v in [0b1010, 0b1011, 0b0101] {
            let row = t.add_row().unwrap();
            t.set_int(0, row, v).unwrap();
        }
        assert_eq!(t.find_all_hamming(0, 0b1010, 1).unwrap(), vec![0, 1]);
        assert_eq!(t.find_all(0, 0b0101).unwrap(), vec![2]);
    }
}

mod enumeration {
    use super::*;

    #[test]
    fn optimize_converts_repetitive_string_columns() {
        let alloc = Alloc::new();
        let mut t = people_table(&alloc);
        let json_before = t.to_json().unwrap();

        t.optimize().unwrap();

        assert_eq!(t.real_column_type(1).unwrap(), ColumnKind::StringEnum);
        assert_eq!(
            t.column_type(1).unwrap(),
            ColumnKind::String,
            "user-visible type is unchanged"
        );
        assert_eq!(t.to_json().unwrap(), json_before);
        assert_eq!(t.find_string(1, "ada").unwrap(), Some(0));
        assert_eq!(t.find_string(1, "eve").unwrap(), None);
        // The enum occupies one extra physical slot after the column.
        assert_eq!(t.spec().column_ref_pos(1).unwrap(), 1);
        t.verify().unwrap();
    }

    #[test]
    fn every_cell_reads_the_same_after_optimize() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::String, "word").unwrap();
        let words = ["red", "blue", "red", "red", "blue", "red"];
        for w in words {
            let row = t.add_row().unwrap();
            t.set_string(0, row, w).unwrap();
        }

        t.optimize().unwrap();
        assert_eq!(t.real_column_type(0).unwrap(), ColumnKind::StringEnum);
        for (row, w) in words.iter().enumerate() {
            assert_eq!(t.get_string(0, row).unwrap(), *w);
        }
        assert_eq!(t.find_all_string(0, "blue").unwrap(), vec![1, 4]);
    }

    #[test]
    fn enum_columns_stay_writable() {
        let alloc = Alloc::new();
        let mut t = people_table(&alloc);
        t.optimize().unwrap();

        t.set_string(1, 0, "eve").unwrap();
        assert_eq!(t.get_string(1, 0).unwrap(), "eve");
        let row = t.add_row().unwrap();
        t.set_string(1, row, "ada").unwrap();
        assert_eq!(t.find_all_string(1, "ada").unwrap(), vec![1, 2]);
        t.verify().unwrap();
    }

    #[test]
    fn optimize_skips_high_cardinality_columns() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::String, "unique").unwrap();
        for i in 0..4 {
            let row = t.add_row().unwrap();
            t.set_string(0, row, &format!("value-{i}")).unwrap();
        }
        t.optimize().unwrap();
        assert_eq!(t.real_column_type(0).unwrap(), ColumnKind::String);
    }

    #[test]
    fn columns_after_the_enum_stay_reachable() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::String, "word").unwrap();
        t.add_column(ColumnKind::Int, "n").unwrap();
        for i in 0..4 {
            let row = t.add_row().unwrap();
            t.set_string(0, row, "same").unwrap();
            t.set_int(1, row, i).unwrap();
        }

        t.optimize().unwrap();
        assert_eq!(t.real_column_type(0).unwrap(), ColumnKind::StringEnum);
        // The int column moved one slot right; reads and writes still land.
        assert_eq!(t.get_int(1, 3).unwrap(), 3);
        t.set_int(1, 0, -5).unwrap();
        assert_eq!(t.get_int(1, 0).unwrap(), -5);
        t.verify().unwrap();
    }
}

mod subtables {
    use super::*;

    fn outer_with_children(alloc: &Alloc) -> Table {
        let mut t = Table::new(alloc);
        t.add_column(ColumnKind::Int, "id").unwrap();
        let col = t.add_column(ColumnKind::Table, "children").unwrap();
        t.sub_spec(col)
            .unwrap()
            .add_column(ColumnKind::Int, "v")
            .unwrap();
        t
    }

    #[test]
    fn fresh_cells_hold_the_empty_subtable() {
        let alloc = Alloc::new();
        let mut t = outer_with_children(&alloc);
        t.add_row().unwrap();
        assert_eq!(t.table_size(1, 0).unwrap(), 0);
        assert_eq!(t.to_json().unwrap(), r#"[{"id":0,"children":[]}]"#);
    }

    #[test]
    fn subtable_views_write_through() {
        let alloc = Alloc::new();
        let mut t = outer_with_children(&alloc);
        t.add_row().unwrap();

        {
            let mut sub = t.subtable(1, 0).unwrap();
            sub.add_row().unwrap();
            sub.set_int(0, 0, 9).unwrap();
        }
        assert_eq!(t.table_size(1, 0).unwrap(), 1);
        assert_eq!(
            t.to_json().unwrap(),
            r#"[{"id":0,"children":[{"v":9}]}]"#
        );

        // The subtable survives re-opening the outer table from its ref.
        let again = Table::attach(&alloc, t.top_ref()).unwrap();
        assert_eq!(again.table_size(1, 0).unwrap(), 1);
        assert_eq!(again.subtable(1, 0).unwrap().get_int(0, 0).unwrap(), 9);
    }

    #[test]
    fn two_views_observe_the_same_rows() {
        let alloc = Alloc::new();
        let mut t = outer_with_children(&alloc);
        t.add_row().unwrap();

        let mut a = t.subtable(1, 0).unwrap();
        let mut b = t.subtable(1, 0).unwrap();
        a.add_row().unwrap();
        a.set_int(0, 0, 3).unwrap();

        // The sibling view picks up the materialized cell on its next write
        // and must not re-materialize over it.
        b.add_row().unwrap();
        b.set_int(0, 1, 4).unwrap();
        assert_eq!(b.size(), 2);
        assert_eq!(b.get_int(0, 0).unwrap(), 3);
        assert_eq!(t.table_size(1, 0).unwrap(), 2);
    }

    #[test]
    fn clear_table_resets_a_cell() {
        let alloc = Alloc::new();
        let mut t = outer_with_children(&alloc);
        t.add_row().unwrap();
        {
            let mut sub = t.subtable(1, 0).unwrap();
            sub.add_row().unwrap();
            sub.set_int(0, 0, 1).unwrap();
        }
        assert_eq!(t.table_size(1, 0).unwrap(), 1);

        t.clear_table(1, 0).unwrap();
        assert_eq!(t.table_size(1, 0).unwrap(), 0);
        assert_eq!(t.subtable(1, 0).unwrap().size(), 0);
    }

    #[test]
    fn insert_table_inserts_empty_cells() {
        let alloc = Alloc::new();
        let mut t = outer_with_children(&alloc);
        t.insert_int(0, 0, 1).unwrap();
        t.insert_table(1, 0).unwrap();
        t.insert_done().unwrap();
        assert_eq!(t.table_size(1, 0).unwrap(), 0);
    }

    #[test]
    fn nested_subtables_to_depth_two() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        let outer_col = t.add_column(ColumnKind::Table, "outer").unwrap();
        let outer_spec = t.sub_spec(outer_col).unwrap();
        let inner_col = outer_spec.add_column(ColumnKind::Table, "inner").unwrap();
        outer_spec
            .sub_spec(inner_col)
            .unwrap()
            .add_column(ColumnKind::Int, "v")
            .unwrap();

        t.add_row().unwrap();
        let mut mid = t.subtable(0, 0).unwrap();
        mid.add_row().unwrap();
        let mut leaf = mid.subtable(0, 0).unwrap();
        leaf.add_row().unwrap();
        leaf.set_int(0, 0, 77).unwrap();

        assert_eq!(t.to_json().unwrap(), r#"[{"outer":[{"inner":[{"v":77}]}]}]"#);
    }
}

mod mixed_columns {
    use super::*;

    #[test]
    fn mixed_cells_dispatch_by_tag() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Mixed, "any").unwrap();
        for _ in 0..4 {
            t.add_row().unwrap();
        }

        t.set_mixed(0, 0, MixedValue::Int(12)).unwrap();
        t.set_mixed(0, 1, MixedValue::Bool(true)).unwrap();
        t.set_mixed(0, 2, MixedValue::String("hi".into())).unwrap();
        t.set_mixed(0, 3, MixedValue::Binary(vec![1, 2])).unwrap();

        assert_eq!(t.get_mixed_type(0, 0).unwrap(), ColumnKind::Int);
        assert_eq!(t.get_mixed(0, 2).unwrap(), MixedValue::String("hi".into()));
        assert_eq!(
            t.to_json().unwrap(),
            r#"[{"any":12},{"any":true},{"any":"hi"},{"any":"0102"}]"#
        );
    }

    #[test]
    fn mixed_tables_carry_their_own_schema() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Mixed, "any").unwrap();
        t.add_row().unwrap();
        t.set_mixed(0, 0, MixedValue::Table).unwrap();

        {
            let mut sub = t.subtable(0, 0).unwrap();
            sub.add_column(ColumnKind::String, "tag").unwrap();
            sub.add_row().unwrap();
            sub.set_string(0, 0, "leaf").unwrap();
        }
        assert_eq!(t.get_mixed(0, 0).unwrap(), MixedValue::Table);
        assert_eq!(t.to_json().unwrap(), r#"[{"any":[{"tag":"leaf"}]}]"#);

        // Overwriting the cell drops the embedded table.
        t.set_mixed(0, 0, MixedValue::Int(0)).unwrap();
        assert_eq!(t.to_json().unwrap(), r#"[{"any":0}]"#);
    }
}

mod indexes {
    use super::*;

    #[test]
    fn set_index_accelerates_find_without_changing_results() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Int, "k").unwrap();
        t.add_column(ColumnKind::String, "s").unwrap();
        let data = [9, 4, 9, 1, 4, 9];
        for v in data {
            let row = t.add_row().unwrap();
            t.set_int(0, row, v).unwrap();
            t.set_string(1, row, "pad").unwrap();
        }

        let before: Vec<_> = [9, 4, 1, 0].iter().map(|&v| t.find(0, v).unwrap()).collect();
        assert!(!t.has_index(0).unwrap());
        t.set_index(0).unwrap();
        assert!(t.has_index(0).unwrap());
        let after: Vec<_> = [9, 4, 1, 0].iter().map(|&v| t.find(0, v).unwrap()).collect();
        assert_eq!(before, after);
        t.verify().unwrap();

        // Mutations keep the index consistent.
        t.set_int(0, 0, 2).unwrap();
        t.delete_row(3).unwrap();
        let row = t.add_row().unwrap();
        t.set_int(0, row, 9).unwrap();
        for v in [1, 2, 4, 9, 0] {
            let scan = (0..t.size()).find(|&r| t.get_int(0, r).unwrap() == v);
            assert_eq!(t.find(0, v).unwrap(), scan, "value {v}");
        }
        t.verify().unwrap();

        // String columns cannot be indexed.
        assert!(t.set_index(1).is_err());
    }

    #[test]
    fn indexed_table_reopens_from_ref() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        t.add_column(ColumnKind::Int, "k").unwrap();
        for v in [5, 3, 5] {
            let row = t.add_row().unwrap();
            t.set_int(0, row, v).unwrap();
        }
        t.set_index(0).unwrap();

        let again = Table::attach(&alloc, t.top_ref()).unwrap();
        assert!(again.has_index(0).unwrap());
        assert_eq!(again.find(0, 3).unwrap(), Some(1));
        again.verify().unwrap();
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn dropping_an_owner_frees_the_whole_tree() {
        let alloc = Alloc::new();
        assert_eq!(alloc.borrow().live_count(), 0);
        {
            let mut t = Table::new(&alloc);
            t.add_column(ColumnKind::Int, "id").unwrap();
            let col = t.add_column(ColumnKind::Table, "kids").unwrap();
            t.sub_spec(col)
                .unwrap()
                .add_column(ColumnKind::String, "name")
                .unwrap();
            t.add_row().unwrap();
            let mut sub = t.subtable(1, 0).unwrap();
            sub.add_row().unwrap();
            sub.set_string(0, 0, "nested").unwrap();
            drop(sub);
            assert!(alloc.borrow().live_count() > 0);
        }
        assert_eq!(
            alloc.borrow().live_count(),
            0,
            "the owner reclaims every node, subtables included"
        );
    }

    #[test]
    fn accessors_do_not_free_shared_storage() {
        let alloc = Alloc::new();
        let mut t = people_table(&alloc);
        let live = alloc.borrow().live_count();
        {
            let view = Table::attach(&alloc, t.top_ref()).unwrap();
            assert_eq!(view.get_int(0, 0).unwrap(), 42);
        }
        assert_eq!(alloc.borrow().live_count(), live);
        // The original handle still works after the accessor is gone.
        t.set_int(0, 0, 1).unwrap();
        assert_eq!(t.get_int(0, 0).unwrap(), 1);
    }

    #[test]
    fn view_of_a_cleared_cell_refuses_mutation() {
        let alloc = Alloc::new();
        let mut t = Table::new(&alloc);
        let col = t.add_column(ColumnKind::Table, "kids").unwrap();
        t.sub_spec(col)
            .unwrap()
            .add_column(ColumnKind::Int, "v")
            .unwrap();
        t.add_row().unwrap();

        let mut sub = t.subtable(0, 0).unwrap();
        sub.add_row().unwrap();

        // Clearing through the parent invalidates the view's cached state;
        // the next mutation re-reads the cell and sees the empty table.
        t.clear_table(0, 0).unwrap();
        sub.update_from_parent().unwrap();
        assert_eq!(sub.size(), 0);

        // Deleting the row entirely leaves the view detached.
        t.delete_row(0).unwrap();
        assert!(sub.add_row().is_err());
    }
}
